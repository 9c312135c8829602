//! Matrix Display Controller
//!
//! Twitchチャットを視聴してエモート・絵文字を集計し、Matrix Reloaded
//! LEDパネルディスプレイへ画像として送出するブリッジ。
//!
//! ## 構成
//! - `irc`: TMI（Twitch Messaging Interface）クライアント
//! - `extract`: PRIVMSGからのエモート・絵文字抽出
//! - `downloader`: CDNからの画像取得とディスクキャッシュ
//! - `display`: マトリクスディスプレイへのアップロード
//! - `control`: オペレーター用TCPコマンドインターフェース
//! - `show`: 上記タスク群のライフサイクル管理

pub mod config;
pub mod control;
pub mod display;
pub mod downloader;
pub mod extract;
pub mod irc;
pub mod queue;
pub mod show;
