//! ランキングテーブル（ladder）
//!
//! キャッシュファイル名 → 累積カウントの表示優先度表。挿入順が保存され、
//! 同カウントのタイブレークは先に挿入された方が勝つ。
//!
//! 元実装は単一スレッドの協調スケジューリングを前提にロックなしで
//! テーブルを共有していた。マルチスレッドランタイムでは成立しないため、
//! ここでは操作単位のロックとダーティフラグ＋通知による明示的な
//! 受け渡しに置き換えている（挙動は同じ: ラウンドの排出中も新しい
//! データは蓄積され続ける）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use linked_hash_map::LinkedHashMap;
use tokio::sync::Notify;

/// 挿入順を保存するカウント表
#[derive(Debug, Default)]
pub struct Ladder {
    entries: LinkedHashMap<String, u64>,
}

impl Ladder {
    pub fn new() -> Self {
        Self {
            entries: LinkedHashMap::new(),
        }
    }

    /// カウントを加算する（エントリがなければ挿入順の末尾に作る）
    pub fn add(&mut self, name: &str, count: u64) {
        *self.entries.entry(name.to_string()).or_insert(0) += count;
    }

    /// 最大カウントのエントリ名を返す。同値なら先に挿入された方。
    pub fn top(&self) -> Option<&str> {
        let mut best: Option<(&str, u64)> = None;
        for (name, &count) in self.entries.iter() {
            match best {
                // 厳密な大なり比較なので先勝ちになる
                Some((_, best_count)) if count <= best_count => {}
                _ => best = Some((name.as_str(), count)),
            }
        }
        best.map(|(name, _)| name)
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        self.entries.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// ダウンローダー（書き手）とプッシャー（読み手）が共有するladder
///
/// `wait_for_data`は新規データの通知があるまで待機し、通知をクリアして戻る。
pub struct SharedLadder {
    ladder: Mutex<Ladder>,
    dirty: AtomicBool,
    notify: Notify,
}

impl SharedLadder {
    pub fn new() -> Self {
        Self {
            ladder: Mutex::new(Ladder::new()),
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// カウントを加算し、新規データありの通知を立てる
    pub fn add_count(&self, name: &str, count: u64) {
        self.ladder.lock().unwrap().add(name, count);
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// 新規データが来るまで待機し、通知をクリアする
    pub async fn wait_for_data(&self) {
        loop {
            let notified = self.notify.notified();
            if self.dirty.swap(false, Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// ロックを取ってladderを操作する
    pub fn with<T>(&self, f: impl FnOnce(&mut Ladder) -> T) -> T {
        f(&mut self.ladder.lock().unwrap())
    }

    /// 通知をクリアしてテーブルを空にする（clear・stop用）
    pub fn purge(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        self.ladder.lock().unwrap().clear();
    }
}

impl Default for SharedLadder {
    fn default() -> Self {
        Self::new()
    }
}
