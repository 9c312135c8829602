//! 画像ダウンローダー（Image Acquirer）
//!
//! 作業キューからアイテムを取り出し、CDNから画像を取得して
//! コンテンツアドレスのディスクキャッシュへ保存し、ladderへ
//! カウントを積み上げる。
//!
//! ## リトライ方針
//! - 各リトライサイクルの先頭で両ソースの可用性をプローブする
//! - 403/404は恒久的な禁止IDとして記録し、以後取得しない
//! - 転送・ファイルシステム障害は5分待ってサイクルを最初からやり直す

pub mod cache;
pub mod errors;
pub mod ladder;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::config::{DOWNLOAD_TIMEOUT, EMOJI_CDN_BASE, RECONNECT_BACKOFF, TWITCH_CDN_BASE};
use crate::queue::{EmoteItem, EmoteKind, EmoteQueue};

pub use errors::DownloadError;
pub use ladder::{Ladder, SharedLadder};

/// 画像ソースのベースURL（テストで差し替え可能）
#[derive(Debug, Clone)]
pub struct SourceUrls {
    pub twitch_base: String,
    pub emoji_base: String,
}

impl Default for SourceUrls {
    fn default() -> Self {
        Self {
            twitch_base: TWITCH_CDN_BASE.to_string(),
            emoji_base: EMOJI_CDN_BASE.to_string(),
        }
    }
}

/// サイクル先頭のプローブ結果
#[derive(Debug, Clone, Copy)]
struct Availability {
    twitch: bool,
    emoji: bool,
}

/// 画像取得・キャッシュ・ランキング蓄積を担うコンポーネント
pub struct ImageDownloader {
    queue: Arc<EmoteQueue>,
    forbidden_ids: Arc<Mutex<HashSet<String>>>,
    ladder: Arc<SharedLadder>,
    client: reqwest::Client,
    sources: SourceUrls,
    cache_dir: PathBuf,
}

impl ImageDownloader {
    pub fn new(
        queue: Arc<EmoteQueue>,
        forbidden_ids: Arc<Mutex<HashSet<String>>>,
        ladder: Arc<SharedLadder>,
        sources: SourceUrls,
        cache_dir: PathBuf,
    ) -> Result<Self, DownloadError> {
        std::fs::create_dir_all(&cache_dir)?;
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            queue,
            forbidden_ids,
            ladder,
            client,
            sources,
            cache_dir,
        })
    }

    /// ダウンローダータスク本体
    ///
    /// キャンセルで`Ok(())`。両ソース利用不可は設定起因の致命的エラー。
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DownloadError> {
        loop {
            let availability = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.check_availability() => res?,
            };

            // 定常ループ: アイテムを待ち、取得し、ladderへ積む
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = self.queue.pop() => item,
                };

                let name = match cache::sanitize_filename(&format!("{}_{}", item.kind, item.id)) {
                    Some(name) => name,
                    None => {
                        log::warn!("Downloader: item {:?} has no valid cache name, dropping", item);
                        continue;
                    }
                };
                let path = self.cache_dir.join(&name);

                match self.obtain(&item, &path, availability, &cancel).await {
                    // ファイルが使える（キャッシュヒットまたは取得成功）
                    Ok(true) => self.ladder.add_count(&name, item.count),
                    // このアイテムは諦める（禁止・ソース停止・一時的エラー）
                    Ok(false) => {}
                    Err(DownloadError::Cancelled) => return Ok(()),
                    Err(e) if e.is_recoverable() => {
                        log::error!(
                            "Downloader: transfer failed: {}. Restarting cycle in 5 minutes.",
                            e
                        );
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    /// 両リモートソースの可用性を軽量フェッチで確認する
    async fn check_availability(&self) -> Result<Availability, DownloadError> {
        // Twitch静的CDN: 小さいKappaを取る
        let mut twitch = false;
        let url = format!("{}/25/static/light/1.0", self.sources.twitch_base);
        match self.client.get(&url).send().await {
            Ok(res) if res.status() == StatusCode::OK => twitch = true,
            Ok(res) => {
                log::error!(
                    "Downloader: Twitch emotes CDN URL issue. Response: {}",
                    res.status()
                );
            }
            Err(e) => log::error!("Downloader: HTTPS GET failed: {}", e),
        }
        if !twitch {
            log::error!("Downloader: disabling Twitch emotes download!");
        }

        // 絵文字リポジトリ: 最初のコードポイント😀を取る
        let mut emoji = false;
        let url = format!("{}/1f600.png", self.sources.emoji_base);
        match self.client.get(&url).send().await {
            Ok(res) => match res.status() {
                StatusCode::OK => emoji = true,
                StatusCode::NOT_FOUND => {
                    log::error!(
                        "Downloader: emoji repository not found, app update is required."
                    );
                }
                StatusCode::FORBIDDEN => {
                    log::error!("Downloader: access to emoji repository denied.");
                }
                status => {
                    log::error!("Downloader: emoji repository server error {}.", status);
                }
            },
            Err(e) => log::error!("Downloader: HTTPS GET failed: {}", e),
        }
        if !emoji {
            log::error!("Downloader: disabling emojis download!");
        }

        if !(twitch || emoji) {
            return Err(DownloadError::NoSourceAvailable);
        }
        Ok(Availability { twitch, emoji })
    }

    /// アイテムの画像ファイルを用意する
    ///
    /// 戻り値`Ok(true)`はファイルが使える状態になったことを意味する。
    async fn obtain(
        &self,
        item: &EmoteItem,
        path: &std::path::Path,
        availability: Availability,
        cancel: &CancellationToken,
    ) -> Result<bool, DownloadError> {
        // 存在すればキャッシュヒット、取得は省略
        if path.is_file() {
            return Ok(true);
        }

        let url = match item.kind {
            EmoteKind::Twitch => {
                if !availability.twitch {
                    return Ok(false);
                }
                format!("{}/{}/default/dark/3.0", self.sources.twitch_base, item.id)
            }
            EmoteKind::Emoji => {
                if !availability.emoji {
                    return Ok(false);
                }
                format!("{}/{}.png", self.sources.emoji_base, item.id)
            }
        };

        let res = self.client.get(&url).send().await?;
        match res.status() {
            StatusCode::OK => {
                self.store(res, path, cancel).await?;
                Ok(true)
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                // このIDはプロセスの生存期間を通じて二度と試みない
                log::debug!("Downloader: server error: {} {}", url, res.status());
                log::info!("Downloader: adding {} to forbidden list.", item.id);
                self.forbidden_ids.lock().unwrap().insert(item.id.clone());
                Ok(false)
            }
            status => {
                log::debug!("Downloader: server error: {} {}", url, status);
                Ok(false)
            }
        }
    }

    /// レスポンスボディをキャッシュファイルへ書き込む
    ///
    /// 失敗やキャンセルで中断した場合は書きかけのファイルを残さない。
    async fn store(
        &self,
        res: reqwest::Response,
        path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            res = async {
                let bytes = res.bytes().await?;
                tokio::fs::write(path, &bytes).await?;
                Ok(())
            } => res,
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Setup {
        queue: Arc<EmoteQueue>,
        forbidden: Arc<Mutex<HashSet<String>>>,
        ladder: Arc<SharedLadder>,
        _cache: TempDir,
        downloader: ImageDownloader,
    }

    fn setup(server_url: &str) -> Setup {
        let queue = Arc::new(EmoteQueue::new());
        let forbidden = Arc::new(Mutex::new(HashSet::new()));
        let ladder = Arc::new(SharedLadder::new());
        let cache = TempDir::new().unwrap();
        let downloader = ImageDownloader::new(
            Arc::clone(&queue),
            Arc::clone(&forbidden),
            Arc::clone(&ladder),
            SourceUrls {
                twitch_base: server_url.to_string(),
                emoji_base: server_url.to_string(),
            },
            cache.path().to_path_buf(),
        )
        .unwrap();

        Setup {
            queue,
            forbidden,
            ladder,
            _cache: cache,
            downloader,
        }
    }

    #[tokio::test]
    async fn test_availability_both_sources() {
        let mut server = mockito::Server::new_async().await;
        let _twitch = server
            .mock("GET", "/25/static/light/1.0")
            .with_status(200)
            .create_async()
            .await;
        let _emoji = server
            .mock("GET", "/1f600.png")
            .with_status(200)
            .create_async()
            .await;

        let s = setup(&server.url());
        let availability = s.downloader.check_availability().await.unwrap();
        assert!(availability.twitch);
        assert!(availability.emoji);
    }

    #[tokio::test]
    async fn test_no_source_available_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _twitch = server
            .mock("GET", "/25/static/light/1.0")
            .with_status(500)
            .create_async()
            .await;
        let _emoji = server
            .mock("GET", "/1f600.png")
            .with_status(500)
            .create_async()
            .await;

        let s = setup(&server.url());
        let res = s.downloader.check_availability().await;
        assert!(matches!(res, Err(DownloadError::NoSourceAvailable)));
    }

    #[tokio::test]
    async fn test_run_downloads_and_ranks_item() {
        let mut server = mockito::Server::new_async().await;
        let _probe_t = server
            .mock("GET", "/25/static/light/1.0")
            .with_status(200)
            .create_async()
            .await;
        let _probe_e = server
            .mock("GET", "/1f600.png")
            .with_status(200)
            .create_async()
            .await;
        let _image = server
            .mock("GET", "/25/default/dark/3.0")
            .with_status(200)
            .with_body(b"png bytes")
            .create_async()
            .await;

        let s = setup(&server.url());
        let cache_dir = s.downloader.cache_dir.clone();

        let cancel = CancellationToken::new();
        let task = {
            let token = cancel.clone();
            let downloader = s.downloader;
            tokio::spawn(async move { downloader.run(token).await })
        };

        s.queue
            .push(EmoteItem::new(EmoteKind::Twitch, "25", 2));

        // ladderへの反映を待つ
        tokio::time::timeout(Duration::from_secs(5), s.ladder.wait_for_data())
            .await
            .expect("item should reach the ladder");

        assert_eq!(
            s.ladder.with(|l| l.top().map(str::to_string)).as_deref(),
            Some("twitch_25")
        );
        assert_eq!(
            std::fs::read(cache_dir.join("twitch_25")).unwrap(),
            b"png bytes"
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_not_found_adds_forbidden_id() {
        let mut server = mockito::Server::new_async().await;
        let _image = server
            .mock("GET", "/404666/default/dark/3.0")
            .with_status(404)
            .create_async()
            .await;

        let s = setup(&server.url());
        let item = EmoteItem::new(EmoteKind::Twitch, "404666", 1);
        let path = s.downloader.cache_dir.join("twitch_404666");
        let availability = Availability {
            twitch: true,
            emoji: true,
        };

        let obtained = s
            .downloader
            .obtain(&item, &path, availability, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!obtained);
        assert!(s.forbidden.lock().unwrap().contains("404666"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let mut server = mockito::Server::new_async().await;
        let image = server
            .mock("GET", "/25/default/dark/3.0")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let s = setup(&server.url());
        let path = s.downloader.cache_dir.join("twitch_25");
        std::fs::write(&path, b"cached").unwrap();

        let availability = Availability {
            twitch: true,
            emoji: true,
        };
        let obtained = s
            .downloader
            .obtain(
                &EmoteItem::new(EmoteKind::Twitch, "25", 1),
                &path,
                availability,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(obtained);
        image.assert_async().await;
    }

    #[tokio::test]
    async fn test_unavailable_source_drops_item() {
        let mut server = mockito::Server::new_async().await;
        let image = server
            .mock("GET", "/25/default/dark/3.0")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let s = setup(&server.url());
        let path = s.downloader.cache_dir.join("twitch_25");
        let availability = Availability {
            twitch: false,
            emoji: true,
        };

        let obtained = s
            .downloader
            .obtain(
                &EmoteItem::new(EmoteKind::Twitch, "25", 1),
                &path,
                availability,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!obtained);
        image.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_file() {
        let mut server = mockito::Server::new_async().await;
        let _image = server
            .mock("GET", "/25/default/dark/3.0")
            .with_status(200)
            .with_body(b"data")
            .create_async()
            .await;

        let s = setup(&server.url());
        // 存在しないサブディレクトリ配下を指定して書き込みを失敗させる
        let path = s.downloader.cache_dir.join("missing_subdir/twitch_25");
        let availability = Availability {
            twitch: true,
            emoji: true,
        };

        let res = s
            .downloader
            .obtain(
                &EmoteItem::new(EmoteKind::Twitch, "25", 1),
                &path,
                availability,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(res, Err(DownloadError::Io(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_cache_name_detected() {
        // サニタイズで空になる名前はキャッシュ対象外
        assert!(cache::sanitize_filename("..").is_none());
    }
}
