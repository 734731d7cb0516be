//! Credential pool with round-robin rotation

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::{Error, Result};

struct PoolInner {
    keys: Vec<String>,
    cursor: usize,
}

/// Ordered set of interchangeable API keys.
///
/// Exactly one key is active at a time. Rotating moves the active key to the
/// tail so a key that just failed is tried last, never next. The multiset of
/// keys never changes.
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
}

/// Diagnostic snapshot of a pool. Keys are masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Cursor position of the active key
    pub current_index: usize,
    /// Number of keys in the pool
    pub total_keys: usize,
    /// Masked preview of the active key
    pub current_key_preview: String,
    /// Masked previews in current rotation order
    pub key_order: Vec<String>,
}

impl CredentialPool {
    /// Create a pool. Fails if `keys` is empty.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Config(
                "Credential pool requires at least one key".to_string(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(PoolInner { keys, cursor: 0 }),
        })
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().keys.len()
    }

    /// Always `false`: construction rejects empty pools
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().keys.is_empty()
    }

    /// The active key
    #[must_use]
    pub fn current_key(&self) -> String {
        let inner = self.inner.lock();
        inner.keys[inner.cursor].clone()
    }

    /// Move the active key to the tail and advance to the next one.
    ///
    /// Returns the new active key.
    pub fn rotate(&self) -> String {
        let mut inner = self.inner.lock();
        Self::rotate_locked(&mut inner);
        inner.keys[inner.cursor].clone()
    }

    /// Rotate only if `failed` is still the active key.
    ///
    /// Concurrent callers that failed on the same key rotate the pool once,
    /// not once each. Returns `true` if a rotation happened.
    pub fn rotate_if_current(&self, failed: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.keys[inner.cursor] != failed {
            return false;
        }
        Self::rotate_locked(&mut inner);
        true
    }

    fn rotate_locked(inner: &mut PoolInner) {
        if inner.keys.len() < 2 {
            return;
        }
        let key = inner.keys.remove(inner.cursor);
        inner.keys.push(key);
        if inner.cursor >= inner.keys.len() {
            inner.cursor = 0;
        }
    }

    /// Diagnostic snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            current_index: inner.cursor,
            total_keys: inner.keys.len(),
            current_key_preview: mask_key(&inner.keys[inner.cursor]),
            key_order: inner.keys.iter().map(|k| mask_key(k)).collect(),
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<String> {
        self.inner.lock().keys.clone()
    }
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("CredentialPool")
            .field("current_index", &stats.current_index)
            .field("keys", &stats.key_order)
            .finish()
    }
}

/// Mask a secret for logs: first 8 and last 4 characters.
#[must_use]
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
