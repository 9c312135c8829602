//! ショー制御（Show Controller）
//!
//! チャット接続・ダウンローダー・プッシャーの3タスクを1つのショーとして
//! 起動・停止する。致命的エラーを起こしたタスクはショー全体を巻き込んで
//! 停止させる（片肺運転はしない）。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::display::MatrixPusher;
use crate::downloader::{ImageDownloader, SharedLadder};
use crate::irc::TmiClient;
use crate::queue::EmoteQueue;

/// 実行中のショーのタスクハンドル一式
struct ShowTasks {
    /// ショー全体のキャンセルトークン
    show_cancel: CancellationToken,
    /// チャット接続のみ先に止めるための子トークン
    tmi_cancel: CancellationToken,
    tmi: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ShowTasks {
    async fn join_all(self) {
        let _ = self.tmi.await;
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// ショーのライフサイクルを管理するコンポーネント
pub struct ShowController {
    tmi: Arc<TmiClient>,
    downloader: Arc<ImageDownloader>,
    pusher: Arc<MatrixPusher>,
    queue: Arc<EmoteQueue>,
    ladder: Arc<SharedLadder>,
    running: tokio::sync::Mutex<Option<ShowTasks>>,
}

impl ShowController {
    pub fn new(
        tmi: Arc<TmiClient>,
        downloader: Arc<ImageDownloader>,
        pusher: Arc<MatrixPusher>,
        queue: Arc<EmoteQueue>,
        ladder: Arc<SharedLadder>,
    ) -> Self {
        Self {
            tmi,
            downloader,
            pusher,
            queue,
            ladder,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// ショーを開始する。既に実行中なら`false`。
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if let Some(tasks) = running.as_ref() {
            if !tasks.show_cancel.is_cancelled() {
                return false;
            }
            // 前回のショーが内部エラーで停止している。後始末して再開する。
            if let Some(tasks) = running.take() {
                tasks.join_all().await;
            }
        }

        let show_cancel = CancellationToken::new();
        let tmi_cancel = show_cancel.child_token();

        let tmi = {
            let tmi = Arc::clone(&self.tmi);
            let token = tmi_cancel.clone();
            let show = show_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tmi.run(token).await {
                    log::error!("Show: chat connection failed: {}", e);
                    show.cancel();
                }
            })
        };

        let downloader = {
            let downloader = Arc::clone(&self.downloader);
            let token = show_cancel.clone();
            let show = show_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = downloader.run(token).await {
                    log::error!("Show: downloader failed: {}", e);
                    show.cancel();
                }
            })
        };

        let pusher = {
            let pusher = Arc::clone(&self.pusher);
            let token = show_cancel.clone();
            let show = show_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = pusher.run(token).await {
                    log::error!("Show: display pusher failed: {}", e);
                    show.cancel();
                }
            })
        };

        *running = Some(ShowTasks {
            show_cancel,
            tmi_cancel,
            tmi,
            workers: vec![downloader, pusher],
        });
        log::info!("Show: started.");
        true
    }

    /// ショーを停止する。実行中でなければ`false`。
    ///
    /// 停止順序: チャット接続を切ってから残キューとマトリクスを
    /// クリアし、最後にワーカーを止める。
    pub async fn stop(&self) -> bool {
        let tasks = {
            let mut running = self.running.lock().await;
            match running.take() {
                Some(tasks) => tasks,
                None => return false,
            }
        };

        tasks.tmi_cancel.cancel();
        let _ = tasks.tmi.await;

        let _ = self.clear_all().await;

        tasks.show_cancel.cancel();
        for handle in tasks.workers {
            let _ = handle.await;
        }
        log::info!("Show: stopped.");
        true
    }

    /// ショーが実行中か（内部エラーで自壊したショーは実行中と見なさない）
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|tasks| !tasks.show_cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// 表示を一時停止する。実行中でなければ`false`。
    pub async fn pause(&self) -> bool {
        if !self.is_running().await {
            return false;
        }
        self.pusher.set_pause(true);
        true
    }

    /// 表示を再開する。実行中でなければ`false`。
    pub async fn resume(&self) -> bool {
        if !self.is_running().await {
            return false;
        }
        self.pusher.set_pause(false);
        true
    }

    /// 追加チャンネルへのJOINを要求する
    pub fn join(&self, channels: &str) -> bool {
        self.tmi.request_join(channels)
    }

    /// 作業キュー・ladder・マトリクス表示を全てクリアする
    pub async fn clear_all(&self) -> bool {
        self.queue.clear();
        self.ladder.purge();
        match self.pusher.clear().await {
            Ok(cleared) => cleared,
            Err(e) => {
                log::error!("Show: matrix clear failed: {}", e);
                false
            }
        }
    }
}
