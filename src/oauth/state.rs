//! OAuth state tokens
//!
//! Binds a unique, single-use, time-limited token to each authorization
//! request so the callback can reject forged (CSRF) or replayed redirects.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::Provider;
use crate::Result;
use crate::store::{KeyValueStore, STATES_TABLE};

/// Most recent state issued per provider, for the legacy fallback
const LAST_STATE_TABLE: &str = "oauth_last_state";

/// Default lifetime of a state token
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 60);

/// A persisted state token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// The opaque token sent to the provider
    pub token: String,
    /// Provider the flow was started for
    pub provider: Provider,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Set once on first successful validation
    pub consumed: bool,
}

impl StateEntry {
    /// Fresh, unconsumed entry
    #[must_use]
    pub fn new(token: String, provider: Provider) -> Self {
        Self {
            token,
            provider,
            created_at: Utc::now(),
            consumed: false,
        }
    }

    /// `now - created_at >= ttl`
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.created_at) >= ttl
    }
}

/// Why a state token was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateRejection {
    /// Never issued, already removed, or swept
    #[error("state not found")]
    NotFound,
    /// Issued for a different provider
    #[error("state issued for a different provider")]
    ProviderMismatch,
    /// Already used once
    #[error("state already consumed")]
    AlreadyConsumed,
    /// Older than the TTL
    #[error("state expired")]
    Expired,
    /// Storage failed; the state could not be checked
    #[error("state storage unavailable")]
    Unavailable,
}

/// Issues and validates OAuth state tokens
pub struct OAuthStateManager {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    /// Serializes read-modify-write on the state table
    lock: Mutex<()>,
}

impl OAuthStateManager {
    /// Create a manager with the given TTL
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            lock: Mutex::new(()),
        }
    }

    /// State lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new state token for `provider`
    pub async fn generate_state(&self, provider: Provider) -> Result<String> {
        let token = generate_state_token();
        let entry = StateEntry::new(token.clone(), provider);

        let _guard = self.lock.lock().await;
        self.store
            .put(STATES_TABLE, &token, serde_json::to_value(&entry)?)
            .await?;
        self.store
            .put(LAST_STATE_TABLE, provider.as_str(), Value::String(token.clone()))
            .await?;

        debug!(provider = %provider, "Issued OAuth state");
        Ok(token)
    }

    /// Validate `token` for `provider` and mark it consumed.
    ///
    /// Returns `false` for unknown, mismatched, consumed or expired tokens.
    /// The reason is logged; use [`Self::validate_state`] to inspect it.
    pub async fn validate_and_consume_state(&self, token: &str, provider: Provider) -> bool {
        self.validate_state(token, provider).await.is_ok()
    }

    /// Validate `token` for `provider` and mark it consumed, reporting the
    /// rejection reason. Expired entries are deleted as a side effect.
    pub async fn validate_state(
        &self,
        token: &str,
        provider: Provider,
    ) -> std::result::Result<(), StateRejection> {
        let _guard = self.lock.lock().await;

        let result = self.consume_locked(token, provider).await;
        match &result {
            Ok(()) => debug!(provider = %provider, "OAuth state validated"),
            Err(reason) => warn!(provider = %provider, reason = %reason, "OAuth state rejected"),
        }
        result
    }

    async fn consume_locked(
        &self,
        token: &str,
        provider: Provider,
    ) -> std::result::Result<(), StateRejection> {
        let raw = match self.store.get(STATES_TABLE, token).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(StateRejection::NotFound),
            Err(e) => {
                error!(error = %e, "Failed to read OAuth state");
                return Err(StateRejection::Unavailable);
            }
        };

        let Ok(mut entry) = serde_json::from_value::<StateEntry>(raw) else {
            warn!("Discarding malformed OAuth state entry");
            let _ = self.store.delete(STATES_TABLE, token).await;
            return Err(StateRejection::NotFound);
        };

        if entry.provider != provider {
            return Err(StateRejection::ProviderMismatch);
        }
        if entry.consumed {
            return Err(StateRejection::AlreadyConsumed);
        }
        if entry.is_expired(self.ttl, Utc::now()) {
            if let Err(e) = self.store.delete(STATES_TABLE, token).await {
                error!(error = %e, "Failed to delete expired OAuth state");
            }
            return Err(StateRejection::Expired);
        }

        entry.consumed = true;
        let value = serde_json::to_value(&entry).map_err(|_| StateRejection::Unavailable)?;
        self.store
            .put(STATES_TABLE, token, value)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to persist consumed OAuth state");
                StateRejection::Unavailable
            })?;

        // A consumed token must not come back through the last-known fallback
        if let Ok(Some(Value::String(last))) =
            self.store.get(LAST_STATE_TABLE, provider.as_str()).await
            && last == token
            && let Err(e) = self.store.delete(LAST_STATE_TABLE, provider.as_str()).await
        {
            warn!(error = %e, "Failed to clear last known OAuth state");
        }
        Ok(())
    }

    /// Delete every expired or consumed entry. Returns the number removed.
    pub async fn cleanup_expired_states(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let mut removed = 0;

        for (token, raw) in self.store.list_all(STATES_TABLE).await? {
            let stale = match serde_json::from_value::<StateEntry>(raw) {
                Ok(entry) => entry.consumed || entry.is_expired(self.ttl, now),
                Err(_) => true,
            };
            if stale && self.store.delete(STATES_TABLE, &token).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept stale OAuth states");
        }
        Ok(removed)
    }

    /// Delete one entry (after a completed flow)
    pub async fn remove_state(&self, token: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let existed = self.store.delete(STATES_TABLE, token).await?;

        for (provider, raw) in self.store.list_all(LAST_STATE_TABLE).await? {
            if raw.as_str() == Some(token) {
                self.store.delete(LAST_STATE_TABLE, &provider).await?;
            }
        }
        Ok(existed)
    }

    /// Drop every state (tests, logout)
    pub async fn clear_all_states(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store.clear(STATES_TABLE).await?;
        self.store.clear(LAST_STATE_TABLE).await?;
        info!("Cleared all OAuth states");
        Ok(())
    }

    /// Legacy single-value check: does `token` equal the last state issued
    /// for `provider`? A match consumes the stored value.
    pub async fn matches_last_known_state(&self, token: &str, provider: Provider) -> bool {
        let _guard = self.lock.lock().await;

        let last = match self.store.get(LAST_STATE_TABLE, provider.as_str()).await {
            Ok(Some(Value::String(last))) => last,
            Ok(_) => return false,
            Err(e) => {
                error!(error = %e, "Failed to read last known OAuth state");
                return false;
            }
        };

        let matches: bool = last.as_bytes().ct_eq(token.as_bytes()).into();
        if matches {
            let _ = self.store.delete(LAST_STATE_TABLE, provider.as_str()).await;
        }
        matches
    }

    /// Fetch an entry without touching it
    pub async fn get_entry(&self, token: &str) -> Result<Option<StateEntry>> {
        match self.store.get(STATES_TABLE, token).await? {
            Some(raw) => Ok(serde_json::from_value(raw).ok()),
            None => Ok(None),
        }
    }
}

/// 32 random bytes, base64url without padding (43 chars)
fn generate_state_token() -> String {
    let state_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
