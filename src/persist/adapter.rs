use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use thiserror::Error;

/// Result type alias for storage adapter operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by a [`StorageAdapter`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("storage remove failed: {0}")]
    Remove(String),
}

/// Key-value persistence abstraction consumed by the persistence layer.
///
/// Implementations are owned by the host environment; the persistence
/// middleware only holds a shared reference. Values are opaque strings —
/// the middleware always stores JSON envelopes, but the adapter does not
/// need to know that.
pub trait StorageAdapter: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn read(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn write(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove the value stored under `key`. Removing an absent key is not
    /// an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// In-memory storage adapter for testing and development.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty in-memory adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }
}

/// File-backed storage adapter keeping one JSON file per key.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create an adapter rooted at `root`. The directory is created on the
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl StorageAdapter for FileStorage {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read(e.to_string())),
        }
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| StorageError::Write(e.to_string()))?;
        // Write to a sibling temp file and rename so a crash mid-write
        // cannot leave a torn envelope behind.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|e| StorageError::Write(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Remove(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();

        assert!(storage.read("missing").unwrap().is_none());

        storage.write("key", "value").unwrap();
        assert_eq!(storage.read("key").unwrap().as_deref(), Some("value"));

        storage.write("key", "replaced").unwrap();
        assert_eq!(storage.read("key").unwrap().as_deref(), Some("replaced"));

        storage.remove("key").unwrap();
        assert!(storage.read("key").unwrap().is_none());
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        assert!(storage.read("cart").unwrap().is_none());

        storage.write("cart", r#"{"state":{},"version":0}"#).unwrap();
        assert_eq!(
            storage.read("cart").unwrap().as_deref(),
            Some(r#"{"state":{},"version":0}"#)
        );

        storage.remove("cart").unwrap();
        assert!(storage.read("cart").unwrap().is_none());
        // Removing again is fine.
        storage.remove("cart").unwrap();
    }

    #[test]
    fn file_storage_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.write("cart", "a").unwrap();
        storage.write("profile", "b").unwrap();

        assert_eq!(storage.read("cart").unwrap().as_deref(), Some("a"));
        assert_eq!(storage.read("profile").unwrap().as_deref(), Some("b"));
    }
}
