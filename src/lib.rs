//! postflow
//!
//! Backend core for social-media posting automation.
//!
//! # Features
//!
//! - **Key rotation**: round-robin failover across API key pools on quota
//!   and transient errors (429/5xx), with bounded retries
//! - **OAuth state**: single-use, time-limited anti-CSRF tokens
//! - **Replay protection**: authorization codes are exchanged at most once
//! - **Callback orchestration**: every provider redirect ends in a success or
//!   error redirect
//! - **Pluggable storage**: in-memory or JSON-file tables

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod rotation;
pub mod server;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
