//! Error types shared by all signsync crates.

use thiserror::Error;

/// Top-level error type for all signsync operations.
#[derive(Debug, Error)]
pub enum SignSyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("directory error: {0}")]
    Directory(String),

    /// A user's desired state could not be resolved (e.g. no primary group).
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Non-retryable API response (4xx other than 429).
    #[error("Sign API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Sign API rate limit exceeded (429): {0}")]
    RateLimited(String),

    #[error("Sign API server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Connection-level failure before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("quitting after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("sync error: {0}")]
    Sync(String),
}

impl SignSyncError {
    /// Whether the failure is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Server { .. } | Self::Transport(_)
        )
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::RateLimited(_) => Some(429),
            _ => None,
        }
    }
}

/// A convenience Result alias that defaults to [`SignSyncError`].
pub type Result<T> = std::result::Result<T, SignSyncError>;
