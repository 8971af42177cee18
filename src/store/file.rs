//! Directory-backed store with one JSON file per key.
//!
//! File names are the hex-encoded key, so arbitrary keys map to safe
//! paths. Writers take an exclusive `fs2` lock on the file and readers a
//! shared one, which keeps readers from observing half-written values.
//! Visibility is last-write-wins; there is no compare-and-swap.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;

use super::{check_size, StateStore, StoreError, DEFAULT_MAX_VALUE_BYTES};

const EXTENSION: &str = "json";

/// File-based state store
pub struct FileStore {
    /// Directory holding one file per key
    root: PathBuf,
    max_value_bytes: usize,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store directory: {}", root.display()))?;

        Ok(Self {
            root,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        })
    }

    /// Override the per-value ceiling
    pub fn with_max_value_bytes(mut self, limit: usize) -> Self {
        self.max_value_bytes = limit;
        self
    }

    /// Get the store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", hex::encode(key.as_bytes()), EXTENSION))
    }

    async fn blocking<F, R>(f: F) -> Result<R, StoreError>
    where
        F: FnOnce() -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn read_locked(path: &Path) -> Result<Option<String>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    file.lock_shared()?;
    let mut content = String::new();
    let result = file.read_to_string(&mut content);
    file.unlock()?;
    result?;

    Ok(Some(content))
}

fn write_locked(path: &Path, value: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    file.lock_exclusive()?;
    let result = (|| -> std::io::Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(value.as_bytes())?;
        file.flush()
    })();
    file.unlock()?;
    result?;

    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        Self::blocking(move || read_locked(&path)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_size(key, value, self.max_value_bytes)?;
        let path = self.path_for(key);
        let value = value.to_string();
        Self::blocking(move || write_locked(&path, &value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(key) = hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_and_overwrite() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).unwrap();

        assert_eq!(store.get("lock:x").await.unwrap(), None);

        store.set("lock:x", r#"{"holder":"a-much-longer-value"}"#).await.unwrap();
        store.set("lock:x", r#"{"holder":"b"}"#).await.unwrap();
        assert_eq!(
            store.get("lock:x").await.unwrap(),
            Some(r#"{"holder":"b"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).unwrap();

        store.set("op:a", "1").await.unwrap();
        store.set("circuit:webhook_example_com", "2").await.unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys, vec!["circuit:webhook_example_com", "op:a"]);

        store.delete("op:a").await.unwrap();
        store.delete("op:a").await.unwrap();
        assert_eq!(store.list_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_cas_capability() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path()).unwrap();
        assert!(store.atomic().is_none());
    }
}
