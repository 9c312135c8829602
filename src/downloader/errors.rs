use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no image source available")]
    NoSourceAvailable,

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// リトライサイクル（プローブからやり直し）で回復を試みるエラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DownloadError::Http(_) | DownloadError::Io(_))
    }
}
