// =============================================================================
// 共通設定・定数モジュール
// =============================================================================
// アプリケーション全体で使用する共通の設定値・定数を定義
// =============================================================================

use std::time::Duration;

/// プログラムバージョン
pub const PRGM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Twitch Messaging Interface の接続先ホスト
pub const TMI_HOST: &str = "irc.chat.twitch.tv";

/// Twitch Messaging Interface の接続先ポート（TLS）
pub const TMI_PORT: u16 = 6697;

/// 接続断からの再接続までの待機時間（5分）
///
/// TMI接続とダウンローダーのリトライサイクルで共用する。
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(300);

/// CAP REQ 応答待ちタイムアウト
pub const CAP_TIMEOUT: Duration = Duration::from_secs(5);

/// 認証応答（376）待ちタイムアウト
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Twitch静的CDNのベースURL
pub const TWITCH_CDN_BASE: &str = "https://static-cdn.jtvnw.net/emoticons/v2";

/// 絵文字ビットマップリポジトリのベースURL
pub const EMOJI_CDN_BASE: &str =
    "https://cdn.jsdelivr.net/gh/toine512/twemoji-bitmaps@main/128x128_png32";

/// ダウンローダーHTTPクライアントの全体タイムアウト
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// ディスプレイへのアップロードの全体タイムアウト
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(180);

/// ディスプレイclearリクエストのタイムアウト
pub const CLEAR_TIMEOUT: Duration = Duration::from_secs(30);

/// キャッシュディレクトリ名（システムの一時ディレクトリ配下に作成）
pub const CACHE_DIR_NAME: &str = "matrix_reloaded_cache";

/// 初期状態で禁止されるTwitchエモートID
///
/// 組み合わせて別の絵を作るタイプのエモート（翼・腕など）は
/// 単体で表示しても意味をなさないため除外する。
pub const BUILTIN_FORBIDDEN_EMOTES: &[(&str, &str)] = &[
    ("MercyWing1", "1003187"),
    ("MercyWing2", "1003189"),
    ("PowerUpL", "425688"),
    ("PowerUpR", "425671"),
    ("Squid1", "191762"),
    ("Squid2", "191763"),
    ("Squid4", "191767"),
];
