//! Error types for postflow

use std::io;

use thiserror::Error;

/// Result type alias for postflow
pub type Result<T> = std::result::Result<T, Error>;

/// postflow errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence layer failure
    #[error("Store error: {0}")]
    Store(String),

    /// Every credential attempt failed with a retryable outcome
    #[error("Retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last observed status or transport failure
        last_error: String,
    },

    /// Retry loop aborted by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Transport error (connection refused, TLS, timeout...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// OAuth flow error
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error should trigger a credential rotation
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_) | Self::Io(_))
    }
}
