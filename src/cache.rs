//! Warm-start snapshot cache.
//!
//! Best-effort mirror of the last known row set, consulted once per session
//! before the network snapshot arrives and overwritten after every applied
//! change. Strictly an optimization: read failures degrade to a miss and
//! write failures are logged and swallowed, never propagated.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Row;

/// One cache entry: the full row array plus its capture timestamp. There is
/// no schema versioning; a format change makes old entries fail to decode,
/// which reads treat as a miss.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub rows: Vec<Row>,
    pub captured_at_ms: u64,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {reason}")]
    Store { reason: String },
    #[error("cache encode failed: {reason}")]
    Encode { reason: String },
    #[error("cache decode failed: {reason}")]
    Decode { reason: String },
    #[error("cache lock poisoned")]
    LockPoisoned,
}

/// Pluggable snapshot codec. The default is JSON; callers substitute their
/// own encode/decode pair through configuration.
pub trait Serializer: Send + Sync {
    fn encode(&self, snapshot: &CachedSnapshot) -> Result<Vec<u8>, CacheError>;
    fn decode(&self, bytes: &[u8]) -> Result<CachedSnapshot, CacheError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, snapshot: &CachedSnapshot) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(snapshot).map_err(|e| CacheError::Encode {
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<CachedSnapshot, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Decode {
            reason: e.to_string(),
        })
    }
}

/// Pluggable key-value storage behind the cache, keyed by collection name.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    inner: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let map = self.inner.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let mut map = self.inner.lock().map_err(|_| CacheError::LockPoisoned)?;
        map.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.inner.lock().map_err(|_| CacheError::LockPoisoned)?;
        map.remove(key);
        Ok(())
    }
}

/// One file per collection under `dir`, written atomically via a temp file
/// persisted into place.
#[derive(Clone, Debug)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Collection names double as file names; keep path separators out.
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.snapshot"))
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error(&path, e)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| store_error(&self.dir, e))?;
        let path = self.path_for(key);
        let temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| store_error(&self.dir, e))?;
        fs::write(temp.path(), bytes).map_err(|e| store_error(temp.path(), e))?;
        temp.persist(&path).map_err(|e| CacheError::Store {
            reason: format!("failed to persist {}: {e}", path.display()),
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&path, e)),
        }
    }
}

fn store_error(path: &Path, e: std::io::Error) -> CacheError {
    CacheError::Store {
        reason: format!("{}: {e}", path.display()),
    }
}

/// The warm-start cache facade the engine talks to.
#[derive(Clone)]
pub struct WarmStartCache {
    backend: Arc<dyn CacheStore>,
    serializer: Arc<dyn Serializer>,
}

impl WarmStartCache {
    pub fn new(backend: Arc<dyn CacheStore>) -> Self {
        Self {
            backend,
            serializer: Arc::new(JsonSerializer),
        }
    }

    pub fn with_serializer(backend: Arc<dyn CacheStore>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            backend,
            serializer,
        }
    }

    /// Read the cached snapshot for `name`. Every failure is a logged miss.
    pub fn load(&self, name: &str) -> Option<CachedSnapshot> {
        let bytes = match self.backend.get(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(collection = name, "warm-start cache read failed: {e}");
                return None;
            }
        };
        match self.serializer.decode(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!(collection = name, "warm-start cache entry unusable: {e}");
                None
            }
        }
    }

    /// Overwrite the cached snapshot for `name`. Failures are logged and
    /// swallowed.
    pub fn store(&self, name: &str, rows: Vec<Row>) {
        let snapshot = CachedSnapshot {
            rows,
            captured_at_ms: now_ms(),
        };
        let bytes = match self.serializer.encode(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(collection = name, "warm-start cache encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.put(name, &bytes) {
            tracing::warn!(collection = name, "warm-start cache write failed: {e}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        vec![json!({"id": 1, "title": "a"}).as_object().unwrap().clone()]
    }

    #[test]
    fn memory_store_round_trips() {
        let cache = WarmStartCache::new(Arc::new(MemoryCacheStore::new()));
        cache.store("todos", rows());

        let loaded = cache.load("todos").expect("hit");
        assert_eq!(loaded.rows, rows());
        assert!(loaded.captured_at_ms > 0);
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let cache = WarmStartCache::new(Arc::new(MemoryCacheStore::new()));
        assert!(cache.load("absent").is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        store.put("todos", b"not json").expect("put");

        let cache = WarmStartCache::new(store);
        assert!(cache.load("todos").is_none());
    }

    #[test]
    fn file_store_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = WarmStartCache::new(Arc::new(FileCacheStore::new(dir.path())));

        cache.store("todos", rows());
        let first = cache.load("todos").expect("hit");
        assert_eq!(first.rows, rows());

        let updated = vec![json!({"id": 2}).as_object().unwrap().clone()];
        cache.store("todos", updated.clone());
        assert_eq!(cache.load("todos").expect("hit").rows, updated);
    }

    #[test]
    fn file_store_sanitizes_collection_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCacheStore::new(dir.path());
        store.put("a/b../c", b"x").expect("put");
        assert_eq!(store.get("a/b../c").expect("get"), Some(b"x".to_vec()));
        assert!(dir.path().join("a_b___c.snapshot").exists());
    }

    #[test]
    fn unwritable_dir_store_is_swallowed() {
        let cache = WarmStartCache::new(Arc::new(FileCacheStore::new(
            "/proc/tether-definitely-unwritable",
        )));
        // Must not panic or propagate.
        cache.store("todos", rows());
        assert!(cache.load("todos").is_none());
    }
}
