//! SQLite-backed store with a real compare-and-swap.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{check_size, AtomicStore, StateStore, StoreError, DEFAULT_MAX_VALUE_BYTES};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)";

/// Single-table key-value store.
///
/// Blocking SQLite calls run on the tokio blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_value_bytes: usize,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        })
    }

    /// Override the per-value ceiling
    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = limit;
        self
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn select(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

#[async_trait]
impl StateStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| select(conn, &key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_size(key, value, self.max_value_bytes)?;
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    fn atomic(&self) -> Option<&dyn AtomicStore> {
        Some(self)
    }
}

#[async_trait]
impl AtomicStore for SqliteStore {
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        if let Some(value) = new {
            check_size(key, value, self.max_value_bytes)?;
        }

        let key = key.to_string();
        let expected = expected.map(str::to_string);
        let new = new.map(str::to_string);

        self.with_conn(move |conn| {
            let changed = match (expected, new) {
                (None, Some(new)) => conn.execute(
                    "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, new],
                )?,
                (Some(old), Some(new)) => conn.execute(
                    "UPDATE kv SET value = ?3 WHERE key = ?1 AND value = ?2",
                    params![key, old, new],
                )?,
                (Some(old), None) => conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND value = ?2",
                    params![key, old],
                )?,
                (None, None) => return Ok(select(conn, &key)?.is_none()),
            };
            Ok(changed == 1)
        })
        .await
    }
}
