/*!
Storage backends for save data.

This module defines the storage abstraction (port) consumed by the
persistence engine and the concrete adapters shipped with the crate.
Durability and transport are the backend's responsibility; the engine only
derives flat string keys and moves JSON values through this interface.
*/

pub mod local;
pub mod retrying;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use local::{LocalFileStorage, RecordCodec};
pub use retrying::RetryingStorage;

/// Key-value storage abstraction for save records
///
/// Keys are flat strings such as `bubblePop_playerData` or
/// `bubblePop_stageLog_chunk_3`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: &Value) -> Result<()>;

    /// Load the value under `key`; `None` when the key is absent
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List stored keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let _ = prefix;
        Ok(Vec::new())
    }
}

/// Build a backend from configuration
pub fn backend_from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    config.validate()?;

    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackendKind::Local => {
            let base = config
                .local_base_path
                .clone()
                .ok_or_else(|| crate::DataError::validation("Local backend requires a base path"))?;
            let codec = if config.compress {
                RecordCodec::Gzip
            } else {
                RecordCodec::Plain
            };
            let local = LocalFileStorage::with_base_dir(base).with_codec(codec);
            if config.retry {
                Ok(Arc::new(RetryingStorage::new(local)))
            } else {
                Ok(Arc::new(local))
            }
        }
    }
}

/// Operation counters kept by [`MemoryStorage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageOpCounts {
    pub saves: usize,
    pub loads: usize,
    pub removes: usize,
}

/// Memory-based storage backend
///
/// Stores records in a `HashMap` behind a mutex. Used as the default
/// backend and by tests, which read its operation counters to assert how
/// many backend calls an engine operation issued.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, Value>>,
    saves: AtomicUsize,
    loads: AtomicUsize,
    removes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether a record exists, without counting as a load
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of the backend operation counters
    pub fn op_counts(&self) -> StorageOpCounts {
        StorageOpCounts {
            saves: self.saves.load(Ordering::SeqCst),
            loads: self.loads.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
