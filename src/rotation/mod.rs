//! API key rotation
//!
//! Makes outbound vendor calls (Gemini, Runware, Pixabay...) resilient to
//! per-key quota and rate-limit errors by failing over to the next key in a
//! pool, transparently to the caller.

mod manager;
mod pool;
mod request;
mod transport;

pub use manager::KeyRotationManager;
pub use pool::{CredentialPool, PoolStats, mask_key};
pub use request::{ApiRequest, ApiResponse, KeyPlacement, PreparedRequest};
pub use transport::{HttpTransport, ReqwestTransport};

use std::time::Duration;

use crate::config::{PoolConfig, default_retryable_status_codes};

/// Retry policy for a key pool
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Pause between a failed attempt and the next one
    pub retry_delay: Duration,
    /// Attempts per call; `None` means one per key
    pub max_retries: Option<u32>,
    /// Statuses that trigger rotation
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            max_retries: None,
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl From<&PoolConfig> for RotationConfig {
    fn from(pool: &PoolConfig) -> Self {
        Self {
            retry_delay: pool.retry_delay,
            max_retries: pool.max_retries,
            retryable_status_codes: pool.retryable_status_codes.clone(),
        }
    }
}

impl RotationConfig {
    /// Whether `status` should rotate and retry
    #[must_use]
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}
