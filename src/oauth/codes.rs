//! Authorization code replay tracker
//!
//! A code can leak through referrers, logs or browser history, so each
//! `(code, provider)` pair is exchanged at most once within the retention
//! window, whatever the state token says.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::Provider;
use crate::Result;
use crate::store::{KeyValueStore, USED_CODES_TABLE};

/// Default replay-block window
pub const DEFAULT_CODE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// A consumed code. Only the digest is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedCode {
    /// SHA-256 of the code, hex
    pub code_digest: String,
    /// Provider that issued it
    pub provider: Provider,
    /// When it was consumed
    pub used_at: DateTime<Utc>,
}

impl UsedCode {
    fn is_live(&self, retention: TimeDelta, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.used_at) < retention
    }
}

/// Tracks consumed authorization codes
pub struct AuthCodeTracker {
    store: Arc<dyn KeyValueStore>,
    retention: Duration,
    lock: Mutex<()>,
}

impl AuthCodeTracker {
    /// Create a tracker with the given retention window
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            lock: Mutex::new(()),
        }
    }

    fn retention_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX)
    }

    /// Was `code` already used for `provider` within the retention window?
    ///
    /// Stale records read as absent but are left for the next write to prune.
    pub async fn is_code_used(&self, code: &str, provider: Provider) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.is_used_locked(code, provider).await
    }

    async fn is_used_locked(&self, code: &str, provider: Provider) -> Result<bool> {
        let Some(raw) = self.store.get(USED_CODES_TABLE, &record_key(code, provider)).await? else {
            return Ok(false);
        };
        Ok(serde_json::from_value::<UsedCode>(raw)
            .is_ok_and(|r| r.is_live(self.retention_delta(), Utc::now())))
    }

    /// Record `code` as used, then prune every record past retention
    pub async fn mark_code_as_used(&self, code: &str, provider: Provider) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.mark_locked(code, provider).await
    }

    async fn mark_locked(&self, code: &str, provider: Provider) -> Result<()> {
        let record = UsedCode {
            code_digest: digest(code),
            provider,
            used_at: Utc::now(),
        };
        self.store
            .put(
                USED_CODES_TABLE,
                &record_key(code, provider),
                serde_json::to_value(&record)?,
            )
            .await?;

        let retention = self.retention_delta();
        let now = Utc::now();
        let mut pruned = 0usize;
        for (key, raw) in self.store.list_all(USED_CODES_TABLE).await? {
            let live = serde_json::from_value::<UsedCode>(raw).is_ok_and(|r| r.is_live(retention, now));
            if !live && self.store.delete(USED_CODES_TABLE, &key).await? {
                pruned += 1;
            }
        }

        debug!(provider = %provider, pruned, "Recorded used authorization code");
        Ok(())
    }

    /// Check and record in one step.
    ///
    /// Returns `false` if the code was already used; otherwise records it and
    /// returns `true`. Two concurrent callbacks with the same code cannot both
    /// get `true`.
    pub async fn check_and_mark(&self, code: &str, provider: Provider) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if self.is_used_locked(code, provider).await? {
            return Ok(false);
        }
        self.mark_locked(code, provider).await?;
        Ok(true)
    }

    /// Forget every used code
    pub async fn clear_used_codes(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.clear(USED_CODES_TABLE).await?;
        info!("Cleared used authorization codes");
        Ok(())
    }
}

fn digest(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn record_key(code: &str, provider: Provider) -> String {
    format!("{provider}:{}", digest(code))
}
