//! Shared state store interfaces.
//!
//! The coordination layer only assumes a durable key-value store with
//! last-write-wins visibility. Stores that can do better expose an
//! [`AtomicStore`] through [`StateStore::atomic`], and callers switch to
//! compare-and-swap when it is available.

pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default per-value ceiling (48 KiB)
pub const DEFAULT_MAX_VALUE_BYTES: usize = 48 * 1024;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Value for '{key}' is {size} bytes (limit {limit})")]
    ValueTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("Store '{store}' does not support {capability}")]
    Unsupported {
        store: String,
        capability: &'static str,
    },

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Durable key-value store shared by every invocation context.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate every key (used by the sweeper)
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Compare-and-swap capability, if the backend has one
    fn atomic(&self) -> Option<&dyn AtomicStore> {
        None
    }
}

/// Store backend with a real compare-and-swap primitive.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Replace the value at `key` with `new` only if it currently equals
    /// `expected`. `None` means "absent" on both sides, so
    /// `(Some(old), None)` is a conditional delete.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;
}

/// A decoded record together with the exact raw value it came from
#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub value: T,
    pub raw: String,
}

/// Load and decode a JSON record.
///
/// Values that fail to decode are deleted and reported as absent.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<Stored<T>>, StoreError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(Stored { value, raw })),
        Err(e) => {
            warn!(key, error = %e, "Removing corrupted record");
            delete_if_unchanged(store, key, &raw).await?;
            Ok(None)
        }
    }
}

/// Delete `key` only while it still holds `raw`.
///
/// Uses compare-and-swap when the store has it; otherwise falls back to a
/// plain delete. Returns whether this call removed the value.
pub async fn delete_if_unchanged(
    store: &dyn StateStore,
    key: &str,
    raw: &str,
) -> Result<bool, StoreError> {
    match store.atomic() {
        Some(atomic) => atomic.compare_and_swap(key, Some(raw), None).await,
        None => {
            store.delete(key).await?;
            Ok(true)
        }
    }
}

/// Encode a record as JSON for storage
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// Reject values above the per-value ceiling
pub(crate) fn check_size(key: &str, value: &str, limit: usize) -> Result<(), StoreError> {
    if value.len() > limit {
        return Err(StoreError::ValueTooLarge {
            key: key.to_string(),
            size: value.len(),
            limit,
        });
    }
    Ok(())
}
