//! Persisted tables
//!
//! The OAuth state, used-code and provider-token tables only need get-all/replace
//! semantics, so the storage seam is a flat `(table, key) -> JSON value` map.
//!
//! - [`MemoryStore`]: process-local, backed by `DashMap` (tests, single-node)
//! - [`FileStore`]: one JSON document per table on disk

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use serde_json::Value;

use crate::Result;
use crate::config::{StorageBackend, StorageConfig};

/// Table holding OAuth state entries, keyed by token
pub const STATES_TABLE: &str = "oauth_states";

/// Table holding consumed authorization codes, keyed by `provider:digest`
pub const USED_CODES_TABLE: &str = "used_codes";

/// Table holding exchanged access tokens, keyed by provider
pub const PROVIDER_TOKENS_TABLE: &str = "provider_tokens";

/// Storage backend for the OAuth tables.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request handlers. Read-modify-write atomicity is provided by the callers,
/// not by the store.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch a single value.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Insert or replace a value.
    async fn put(&self, table: &str, key: &str, value: Value) -> Result<()>;

    /// Delete a value. Returns `true` if it existed.
    async fn delete(&self, table: &str, key: &str) -> Result<bool>;

    /// List every `(key, value)` pair in a table.
    async fn list_all(&self, table: &str) -> Result<Vec<(String, Value)>>;

    /// Drop every entry in a table.
    async fn clear(&self, table: &str) -> Result<()> {
        for (key, _) in self.list_all(table).await? {
            self.delete(table, &key).await?;
        }
        Ok(())
    }
}

/// Build the configured store
pub fn open(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => {
            let store = match &config.directory {
                Some(dir) => FileStore::new(dir.clone())?,
                None => FileStore::default_location()?,
            };
            Ok(Arc::new(store))
        }
    }
}
