//! In-memory store backed by `DashMap`

use dashmap::DashMap;
use serde_json::Value;

use super::KeyValueStore;
use crate::Result;

/// Process-local table store.
///
/// Each table is its own `DashMap` so that listing one table never contends
/// with writes to another.
pub struct MemoryStore {
    tables: DashMap<String, DashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Number of entries in a table
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .get(table)
            .and_then(|t| t.get(key).map(|v| v.value().clone())))
    }

    async fn put(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool> {
        Ok(self
            .tables
            .get(table)
            .is_some_and(|t| t.remove(key).is_some()))
    }

    async fn list_all(&self, table: &str) -> Result<Vec<(String, Value)>> {
        Ok(self.tables.get(table).map_or_else(Vec::new, |t| {
            t.iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect()
        }))
    }

    async fn clear(&self, table: &str) -> Result<()> {
        if let Some(t) = self.tables.get(table) {
            t.clear();
        }
        Ok(())
    }
}
