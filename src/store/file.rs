//! File-backed store
//!
//! Persists each table as a single JSON object (`<table>.json`) so OAuth
//! state survives restarts between the authorize redirect and the callback.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::KeyValueStore;
use crate::{Error, Result};

type Table = BTreeMap<String, Value>;

/// JSON-file table store.
///
/// Disk I/O runs on tokio's blocking pool; the async methods only hand
/// work over and await it.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<TableFiles>,
}

struct TableFiles {
    /// Base directory for table files
    base_dir: PathBuf,
    /// Serializes whole-file rewrites
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .map_err(|e| Error::Store(format!("Failed to create state dir: {e}")))?;
        }

        Ok(Self {
            inner: Arc::new(TableFiles {
                base_dir,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Create a store in the default location (~/.postflow/state)
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Store("Cannot determine home directory".to_string()))?;

        Self::new(home.join(".postflow").join("state"))
    }

    /// Run `f` against the table files on the blocking pool
    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&TableFiles) -> Result<R> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::Store(format!("Store task failed: {e}")))?
    }
}

impl TableFiles {
    fn table_path(&self, table: &str) -> PathBuf {
        self.base_dir.join(format!("{table}.json"))
    }

    fn read_table(&self, table: &str) -> Result<Table> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(Table::new());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("Failed to read {}: {e}", path.display())))?;

        match serde_json::from_str(&content) {
            Ok(t) => Ok(t),
            Err(e) => {
                // Unreadable file: start the table over
                warn!(table = %table, error = %e, "Discarding unreadable table file");
                Ok(Table::new())
            }
        }
    }

    fn write_table(&self, table: &str, data: &Table) -> Result<()> {
        let path = self.table_path(table);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(data)?;
        fs::write(&tmp, content)
            .map_err(|e| Error::Store(format!("Failed to write {}: {e}", tmp.display())))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&tmp, perms);
        }

        fs::rename(&tmp, &path)
            .map_err(|e| Error::Store(format!("Failed to replace {}: {e}", path.display())))?;

        debug!(table = %table, entries = data.len(), "Persisted table");
        Ok(())
    }

    fn read(&self, table: &str) -> Result<Table> {
        let _guard = self.write_lock.lock();
        self.read_table(table)
    }

    fn modify<R>(&self, table: &str, f: impl FnOnce(&mut Table) -> R) -> Result<R> {
        let _guard = self.write_lock.lock();
        let mut data = self.read_table(table)?;
        let out = f(&mut data);
        self.write_table(table, &data)?;
        Ok(out)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let (table, key) = (table.to_string(), key.to_string());
        self.blocking(move |files| Ok(files.read(&table)?.remove(&key)))
            .await
    }

    async fn put(&self, table: &str, key: &str, value: Value) -> Result<()> {
        let (table, key) = (table.to_string(), key.to_string());
        self.blocking(move |files| {
            files.modify(&table, |t| {
                t.insert(key, value);
            })
        })
        .await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<bool> {
        let (table, key) = (table.to_string(), key.to_string());
        self.blocking(move |files| files.modify(&table, |t| t.remove(&key).is_some()))
            .await
    }

    async fn list_all(&self, table: &str) -> Result<Vec<(String, Value)>> {
        let table = table.to_string();
        self.blocking(move |files| Ok(files.read(&table)?.into_iter().collect()))
            .await
    }

    async fn clear(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.blocking(move |files| files.modify(&table, Table::clear))
            .await
    }
}
