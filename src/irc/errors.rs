use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("requested TMI capabilities were refused: {0}")]
    CapabilitiesRefused(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unexpected TMI response: {0}")]
    Protocol(String),
}

impl IrcError {
    /// 再接続で回復できない設定起因のエラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IrcError::CapabilitiesRefused(_) | IrcError::AuthenticationFailed | IrcError::Protocol(_)
        )
    }
}
