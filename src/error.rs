//! Error types shared by the event model, the wire codec and both engines.

use thiserror::Error;

/// Reasons an event fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("id does not match event contents")]
    IdMismatch,

    #[error("signature does not match event hash")]
    BadSignature,
}

/// Crate error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Secret key was not 32 bytes of hex, or not a valid scalar.
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    /// `sign` was called on an event that already carries an id and signature.
    #[error("event is already signed")]
    AlreadySigned,

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that is not a valid protocol message.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("malformed tag: {0}")]
    Tag(String),

    #[error("invalid subscription id: {0}")]
    SubscriptionId(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection {0} is not registered")]
    UnknownConnection(u64),

    #[error("not connected to any relay")]
    NotConnected,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;
