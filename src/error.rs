//! Error types for SetuLink

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// SetuLink error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket could not be opened or is not in a usable state
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation did not complete within its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation requested that is invalid for the current connection state
    #[error("invalid state: {0}")]
    State(String),

    /// Malformed command rejected before transmission
    #[error("bad command: {0}")]
    Command(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration encode error
    #[error("config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),
}

impl Error {
    /// True when the error only means a deadline elapsed, not that the link died.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Io(e) => is_poll_timeout(e),
            _ => false,
        }
    }
}

/// Whether an I/O error is a read/write timeout rather than a dead link.
///
/// Blocking socket calls report an elapsed `SO_RCVTIMEO`/`SO_SNDTIMEO` as
/// `WouldBlock` on Unix and `TimedOut` on Windows.
pub(crate) fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
