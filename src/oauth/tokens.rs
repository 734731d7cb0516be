//! Persisted provider access tokens
//!
//! One token per provider, written after a successful code exchange so the
//! posting side can act on the connected account.

use std::sync::Arc;

use tracing::{debug, warn};

use super::Provider;
use super::exchange::TokenInfo;
use crate::Result;
use crate::store::{KeyValueStore, PROVIDER_TOKENS_TABLE};

/// Token storage over the shared table store
#[derive(Clone)]
pub struct TokenStorage {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStorage {
    /// Create token storage
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the token for `provider`. Unparseable records read as absent.
    pub async fn load(&self, provider: Provider) -> Result<Option<TokenInfo>> {
        let Some(raw) = self.store.get(PROVIDER_TOKENS_TABLE, provider.as_str()).await? else {
            return Ok(None);
        };
        match serde_json::from_value(raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(provider = %provider, error = %e, "Ignoring unreadable stored token");
                Ok(None)
            }
        }
    }

    /// Save (replace) the token for `provider`
    pub async fn save(&self, provider: Provider, token: &TokenInfo) -> Result<()> {
        self.store
            .put(
                PROVIDER_TOKENS_TABLE,
                provider.as_str(),
                serde_json::to_value(token)?,
            )
            .await?;
        debug!(provider = %provider, "Saved provider token");
        Ok(())
    }

    /// Forget the token for `provider`
    pub async fn delete(&self, provider: Provider) -> Result<bool> {
        self.store.delete(PROVIDER_TOKENS_TABLE, provider.as_str()).await
    }
}
