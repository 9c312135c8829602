//! TMI（Twitch Messaging Interface）プロトコルエンジン
//!
//! CRLF行フレーミング、IRCメッセージパース、接続状態機械を提供する。

pub mod client;
pub mod errors;
pub mod framing;
pub mod message;

pub use client::{ChatHandler, TmiClient};
pub use errors::IrcError;
pub use framing::LineReader;
pub use message::{parse_params, IrcMessage, IrcPrefix};
