//! エモート作業キュー
//!
//! 抽出パイプライン（プロデューサー）とダウンローダー（コンシューマー）の間で
//! 検出済みアイテムを受け渡すFIFOキュー。容量無制限のため投入側は待たされない。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::Notify;

/// 検出アイテムの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmoteKind {
    /// Twitchプラットフォーム固有エモート
    Twitch,
    /// Unicode絵文字クラスター
    Emoji,
}

impl fmt::Display for EmoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmoteKind::Twitch => write!(f, "twitch"),
            EmoteKind::Emoji => write!(f, "emoji"),
        }
    }
}

/// チャットメッセージから抽出された1件の絵項目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmoteItem {
    pub kind: EmoteKind,
    /// TwitchエモートID、または絵文字のコードポイントキー（例: "1f600"）
    pub id: String,
    /// メッセージ内での出現回数（1以上）
    pub count: u64,
}

impl EmoteItem {
    pub fn new(kind: EmoteKind, id: impl Into<String>, count: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            count,
        }
    }
}

/// 容量無制限のFIFO作業キュー
///
/// `push`は同期・非ブロッキング、`pop`はアイテムが来るまで待機する。
/// `clear`で滞留中のアイテムをすべて破棄できる（showの停止・クリア時）。
pub struct EmoteQueue {
    items: Mutex<VecDeque<EmoteItem>>,
    notify: Notify,
}

impl EmoteQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// アイテムを末尾へ投入する（非ブロッキング）
    pub fn push(&self, item: EmoteItem) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    /// 先頭のアイテムを取り出す。空の間は待機する。
    pub async fn pop(&self) -> EmoteItem {
        loop {
            // 競合回避のため、キューを確認する前に通知の受付を開始しておく
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().unwrap().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    /// 先頭のアイテムがあれば取り出す（非ブロッキング）
    pub fn try_pop(&self) -> Option<EmoteItem> {
        self.items.lock().unwrap().pop_front()
    }

    /// 滞留中のアイテムをすべて破棄する
    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    /// 滞留中のアイテム数
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EmoteQueue {
    fn default() -> Self {
        Self::new()
    }
}
