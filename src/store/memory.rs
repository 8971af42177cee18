//! In-process store, mainly for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{check_size, AtomicStore, StateStore, StoreError, DEFAULT_MAX_VALUE_BYTES};

/// HashMap-backed store.
///
/// Every operation completes without yielding, so each call is atomic with
/// respect to other tasks.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    /// Whether `atomic()` exposes compare-and-swap
    cas: bool,
    max_value_bytes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with compare-and-swap enabled
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cas: true,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }

    /// Create an empty store that only offers last-write-wins semantics
    pub fn last_write_wins() -> Self {
        Self {
            cas: false,
            ..Self::new()
        }
    }

    /// Override the per-value ceiling
    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = limit;
        self
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_size(key, value, self.max_value_bytes)?;
        self.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn atomic(&self) -> Option<&dyn AtomicStore> {
        if self.cas {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        if let Some(value) = new {
            check_size(key, value, self.max_value_bytes)?;
        }

        let mut entries = self.write();
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_string());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }
}
