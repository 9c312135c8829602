//! マトリクスディスプレイへの画像アップローダー（Display Pusher）
//!
//! ladderのスナップショットを排出しながら最優先の画像をディスプレイの
//! HTTP APIへPOSTする。応答コードに応じてリトライ・除去・恒久BANを行う。
//!
//! ## ディスプレイの応答コード
//! - 200 OK: 表示された
//! - 503 Service Unavailable: スロットなし、待って再試行
//! - 408 Request Timeout: 転送に失敗、すぐ再試行
//! - 413 Content Too Large / 422 Unprocessable Content: ファイル不良、恒久BAN
//! - 500 Internal Server Error: サーバー側異常、このエントリは諦める

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{CLEAR_TIMEOUT, UPLOAD_TIMEOUT};
use crate::downloader::SharedLadder;

/// 一時停止中のポーリング間隔
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// 503（スロット待ち）の再試行間隔
const RETRY_FULL_INTERVAL: Duration = Duration::from_millis(2500);

/// 408（転送失敗）の再試行間隔
const RETRY_TIMEOUT_INTERVAL: Duration = Duration::from_millis(100);

/// 転送レベル障害の再試行間隔
const RETRY_TRANSPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected matrix HTTP response: {0}")]
    UnexpectedStatus(StatusCode),
}

/// ディスプレイへのアップロードコンポーネント
pub struct MatrixPusher {
    host: String,
    ladder: Arc<SharedLadder>,
    cache_dir: PathBuf,
    /// ディスプレイに恒久拒否されたキャッシュファイル名。クリアされない。
    banlist: Mutex<HashSet<String>>,
    /// trueの間はアップロードを保留する（抽出・取得は続く）
    pause: AtomicBool,
    client: reqwest::Client,
}

impl MatrixPusher {
    pub fn new(
        host: &str,
        ladder: Arc<SharedLadder>,
        cache_dir: PathBuf,
    ) -> Result<Self, DisplayError> {
        let client = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self {
            host: host.trim().to_string(),
            ladder,
            cache_dir,
            banlist: Mutex::new(HashSet::new()),
            pause: AtomicBool::new(false),
            client,
        })
    }

    /// アップロードの一時停止・再開
    pub fn set_pause(&self, pause: bool) {
        self.pause.store(pause, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// ディスプレイをクリアする
    ///
    /// `Ok(true)`は成功、`Ok(false)`は報告済みの失敗（500・転送障害）。
    /// 列挙外の応答コードはプロトコル違反として`Err`。
    pub async fn clear(&self) -> Result<bool, DisplayError> {
        let url = format!("http://{}/clear", self.host);
        let res = match self.client.get(&url).timeout(CLEAR_TIMEOUT).send().await {
            Ok(res) => res,
            Err(e) => {
                log::error!("Display: unable to clear matrix! {}", e);
                return Ok(false);
            }
        };

        match res.status() {
            StatusCode::OK => {
                log::info!("Display: matrix cleared.");
                Ok(true)
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                log::error!("Display: clearing matrix failed.");
                Ok(false)
            }
            status => Err(DisplayError::UnexpectedStatus(status)),
        }
    }

    /// アップロードタスク本体
    ///
    /// キャンセルで`Ok(())`。列挙外の応答コードは`Err`で抜ける。
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DisplayError> {
        loop {
            // 新規データが来るまで待機
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.ladder.wait_for_data() => {}
            }

            // ladderが空になるまで排出する
            loop {
                // 一時停止トラップ。抽出とダウンロードには影響しない。
                while self.is_paused() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                    }
                }

                let name = match self.ladder.with(|l| l.top().map(str::to_string)) {
                    Some(name) => name,
                    None => break, // 空になったので次のラウンドを待つ
                };

                // 過去にBANされたファイルはネットワークを使わず除去
                if self.banlist.lock().unwrap().contains(&name) {
                    self.ladder.with(|l| l.remove(&name));
                    continue;
                }

                // キャッシュファイルを読む
                let bytes = match tokio::fs::read(self.cache_dir.join(&name)).await {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        log::error!("Display: cache miss. This isn't supposed to happen!");
                        self.ladder.with(|l| l.remove(&name));
                        continue;
                    }
                };

                let wait = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = self.upload(&name, bytes) => res?,
                };
                if let Some(interval) = wait {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    /// 1ファイルをPOSTし、応答方針を適用する
    ///
    /// 戻り値は再試行前に待つ時間。`None`はこのエントリの処理完了。
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<Option<Duration>, DisplayError> {
        let url = format!("http://{}/image", self.host);
        let res = match self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                // 回復可能かもしれない転送障害。30秒待って同じエントリを再試行。
                log::warn!("Display: matrix unavailable. {}. Retry in 30 seconds.", e);
                return Ok(Some(RETRY_TRANSPORT_INTERVAL));
            }
        };

        match res.status() {
            StatusCode::OK => {
                self.ladder.with(|l| l.remove(name));
                log::debug!("Display: uploaded {} to matrix", name);
                Ok(None)
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                log::debug!("Display: matrix memory full");
                Ok(Some(RETRY_FULL_INTERVAL))
            }
            StatusCode::REQUEST_TIMEOUT => {
                log::error!(
                    "Display: matrix request timeout, something went wrong with the transfer. Retrying."
                );
                Ok(Some(RETRY_TIMEOUT_INTERVAL))
            }
            StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
                self.ladder.with(|l| l.remove(name));
                self.banlist.lock().unwrap().insert(name.to_string());
                log::info!("Display: adding {} to forbidden list.", name);
                Ok(None)
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                self.ladder.with(|l| l.remove(name));
                log::error!("Display: matrix internal server error!");
                Ok(None)
            }
            status => Err(DisplayError::UnexpectedStatus(status)),
        }
    }
}
