//! Error types for audiosmith

use thiserror::Error;

use crate::retry::is_recoverable;

/// Result type alias for audiosmith operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in audiosmith
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone permission denied or no capture device
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    /// Speech-to-text service unreachable after retries
    #[error("speech-to-text stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Low-level error on an open speech-to-text connection
    #[error("speech-to-text connection error: {0}")]
    Stream(String),

    /// Transport failure talking to a backend
    #[error("network error: {0}")]
    Network(String),

    /// Backend answered with a non-2xx status
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// Request aborted by its cancellation token
    #[error("request cancelled")]
    Cancelled,

    /// Playback superseded or stopped before it finished
    #[error("playback interrupted")]
    Interrupted,

    /// Speech synthesis failed after retries
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Malformed request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is the expected outcome of the user interrupting
    /// the assistant. These are never shown to the user.
    #[must_use]
    pub const fn is_barge_in(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupted)
    }

    /// Whether retrying the failed operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Stream(_) => true,
            Self::Server { status, body } => is_recoverable(*status, body),
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| is_recoverable(s.as_u16(), ""))
            }
            _ => false,
        }
    }

    /// Build a [`Error::Server`] from a status and response body
    #[must_use]
    pub fn server(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::Server {
            status: status.as_u16(),
            body: body.into(),
        }
    }
}
