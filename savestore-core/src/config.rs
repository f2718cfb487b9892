//! Configuration for the storage backend, engine, cache, queue and importer
//!
//! Every section has serde defaults so a partial JSON file is enough to
//! override a single value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{DataError, Result};

/// Storage key namespace used by the game
pub const DEFAULT_NAMESPACE: &str = "bubblePop";

/// Game version compared against import bundle headers
pub const DEFAULT_GAME_VERSION: &str = "1.0.0";

/// Bundle format name written on export and expected on import
pub const SAVE_FORMAT: &str = "BubblePopSave";

/// Enumeration of supported storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackendKind {
    /// Process-local map, lost on exit
    Memory,
    /// One JSON file per key under a base directory
    Local,
}

/// Configuration structure for storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackendKind,
    /// Base path for local storage
    pub local_base_path: Option<PathBuf>,
    /// Gzip record files written by the local backend
    pub compress: bool,
    /// Retry transient backend failures with exponential backoff
    pub retry: bool,
}

impl StorageConfig {
    /// Create a configuration for the in-memory backend
    pub fn memory() -> Self {
        StorageConfig {
            backend: StorageBackendKind::Memory,
            local_base_path: None,
            compress: false,
            retry: false,
        }
    }

    /// Create a configuration for a local directory backend
    pub fn local<P: AsRef<Path>>(base_path: P) -> Self {
        StorageConfig {
            backend: StorageBackendKind::Local,
            local_base_path: Some(base_path.as_ref().to_path_buf()),
            compress: false,
            retry: false,
        }
    }

    /// Enable gzip compression for the local backend
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Parse a storage URI
    ///
    /// Supports formats:
    /// - `memory://` for the in-memory backend
    /// - `file:///some/dir` or a plain path for the local directory backend
    pub fn from_uri(uri: &str) -> Result<StorageConfig> {
        if uri.starts_with("memory://") {
            return Ok(StorageConfig::memory());
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.is_empty() {
            return Err(DataError::validation("Invalid storage URI: missing path"));
        }
        Ok(StorageConfig::local(path))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StorageBackendKind::Local => match &self.local_base_path {
                Some(path) if !path.as_os_str().is_empty() => Ok(()),
                _ => Err(DataError::validation(
                    "Local backend requires a non-empty base path",
                )),
            },
            StorageBackendKind::Memory => Ok(()),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory()
    }
}

/// Persistence engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every backend key (`<namespace>_<dataType>`)
    pub namespace: String,
    /// Current game version, also stamped into exports
    pub game_version: String,
    /// Items per chunk for large data
    pub chunk_size: usize,
    /// Upper bound on concurrently running chunk workers
    pub max_parallel_chunks: usize,
    /// Refuse to write large data that would need more chunks than this
    pub max_chunks: usize,
    /// Generic records serializing above this many bytes are chunked
    pub large_threshold_bytes: usize,
    /// Emit `LargeDataProgress` events
    pub emit_progress: bool,
    /// Data types that are always stored as chunks
    pub large_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            game_version: DEFAULT_GAME_VERSION.to_string(),
            chunk_size: 1000,
            max_parallel_chunks: num_cpus::get().clamp(2, 8),
            max_chunks: 10_000,
            large_threshold_bytes: 1024 * 1024,
            emit_progress: true,
            large_types: Vec::new(),
        }
    }
}

/// Read cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when a load does not specify one
    pub default_ttl_ms: u64,
    /// Capacity before eviction kicks in
    pub max_entries: usize,
    /// Drop an expired entry when a lookup finds it; otherwise it stays
    /// until `Cache::cleanup`
    pub cleanup_on_access: bool,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5 * 60 * 1000,
            max_entries: 1000,
            cleanup_on_access: true,
        }
    }
}

/// Async operation queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum operations in flight at once
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

/// Import reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Run the injected validator on each type right before it is written
    pub validate_before_import: bool,
    /// Skip failing types instead of aborting the whole import
    pub allow_partial_import: bool,
    /// Require an exact game version match
    pub strict_version_check: bool,
    /// Hard ceiling on the serialized bundle size in bytes
    pub max_import_size: usize,
    /// Soft ceiling; bundles above it produce a warning
    pub size_warning_threshold: usize,
    /// Imports slower than this are flagged in the outcome
    pub target_duration_ms: u64,
    /// Restore already-committed types when a later type fails
    pub atomic: bool,
    /// Header format name recognised without a warning
    pub expected_format: String,
}

impl ImportConfig {
    pub fn target_duration(&self) -> Duration {
        Duration::from_millis(self.target_duration_ms)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            validate_before_import: true,
            allow_partial_import: true,
            strict_version_check: false,
            max_import_size: 50 * 1024 * 1024,
            size_warning_threshold: 10 * 1024 * 1024,
            target_duration_ms: 2000,
            atomic: false,
            expected_format: SAVE_FORMAT.to_string(),
        }
    }
}

/// Complete configuration for a data context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub import: ImportConfig,
}

impl DataConfig {
    /// Load configuration from a JSON file; missing sections use defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DataConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        let mut errors = Vec::new();
        if !crate::manager::is_valid_data_type(&self.engine.namespace) {
            errors.push(format!("invalid namespace '{}'", self.engine.namespace));
        }
        for data_type in &self.engine.large_types {
            if !crate::manager::is_valid_data_type(data_type) {
                errors.push(format!("invalid large data type '{data_type}'"));
            }
        }
        if self.engine.chunk_size == 0 {
            errors.push("chunk_size must be greater than zero".to_string());
        }
        if self.engine.max_parallel_chunks == 0 {
            errors.push("max_parallel_chunks must be greater than zero".to_string());
        }
        if self.queue.max_concurrency == 0 {
            errors.push("max_concurrency must be greater than zero".to_string());
        }
        if self.cache.max_entries == 0 {
            errors.push("max_entries must be greater than zero".to_string());
        }
        if self.import.size_warning_threshold > self.import.max_import_size {
            errors.push("size_warning_threshold exceeds max_import_size".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DataError::Validation { errors })
        }
    }
}
