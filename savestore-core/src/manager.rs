/*!
Persistence engine.

[`DataManager`] is the public save/load surface. It routes each data type
through a handler registry fixed at construction, reads through the
[`Cache`], admits backend work through the [`AsyncQueue`] and moves large
records through the [`ChunkProcessor`].

Backend keys are derived from the namespace:

| record           | key                                |
|------------------|------------------------------------|
| simple record    | `<namespace>_<dataType>`           |
| chunk `i`        | `<namespace>_<dataType>_chunk_<i>` |
| chunk metadata   | `<namespace>_<dataType>_metadata`  |

Work that already holds a queue slot never asks the queue for another one;
chunk reads and writes go straight to the backend through the chunk
processor.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheSetOptions, CacheStats};
use crate::chunk::{self, ChunkInfo, ChunkMetadata, ChunkOptions, ChunkProcessor, ChunkRecord, ChunkStats, DataStructure};
use crate::config::EngineConfig;
use crate::events::{DataEvent, EventBus, LargeDataOperation};
use crate::observability::{self, MetricEvent};
use crate::queue::{AsyncQueue, BatchOptions, Priority, QueueStatus};
use crate::storage::StorageBackend;
use crate::sync::{SyncCollaborator, SyncReport, SyncStatus};
use crate::{DataError, OperationTag, Result};

pub const PLAYER_DATA: &str = "playerData";
pub const SETTINGS: &str = "settings";
pub const STATISTICS: &str = "statistics";

/// Data types whose payload must be a JSON object
pub const CORE_DATA_TYPES: [&str; 3] = [PLAYER_DATA, SETTINGS, STATISTICS];

const MAX_DATA_TYPE_LEN: usize = 50;

/// Whether `name` is usable as a data type (and key segment):
/// 1 to 50 ASCII letters, digits, `_` or `-`
pub fn is_valid_data_type(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DATA_TYPE_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_data_type(data_type: &str) -> Result<()> {
    if is_valid_data_type(data_type) {
        Ok(())
    } else {
        Err(DataError::InvalidDataType(data_type.to_string()))
    }
}

/// External owner of a data type's live state, such as an in-memory player
/// profile that persists itself
#[async_trait]
pub trait Persistable: Send + Sync {
    async fn save(&self, data: &Value) -> Result<()>;

    async fn load(&self) -> Result<Value>;
}

/// How a data type is stored
#[derive(Clone)]
pub enum DataHandler {
    /// One record holding a JSON object
    Object,
    /// One record, chunked once it outgrows the large-data threshold
    Generic,
    /// Always chunked
    Large,
    /// Delegated to an external store
    Store(Arc<dyn Persistable>),
}

impl DataHandler {
    pub fn kind(&self) -> &'static str {
        match self {
            DataHandler::Object => "object",
            DataHandler::Generic => "generic",
            DataHandler::Large => "large",
            DataHandler::Store(_) => "store",
        }
    }
}

impl fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Data type to handler table. Unregistered types are [`DataHandler::Generic`].
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, DataHandler>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with `playerData`, `settings` and `statistics` as object records
    pub fn with_core_types() -> Self {
        let handlers = CORE_DATA_TYPES
            .iter()
            .map(|name| (name.to_string(), DataHandler::Object))
            .collect();
        Self { handlers }
    }

    pub fn register(&mut self, data_type: &str, handler: DataHandler) -> Result<()> {
        validate_data_type(data_type)?;
        self.handlers.insert(data_type.to_string(), handler);
        Ok(())
    }

    pub fn resolve(&self, data_type: &str) -> DataHandler {
        self.handlers
            .get(data_type)
            .cloned()
            .unwrap_or(DataHandler::Generic)
    }

    /// Registered data types, sorted
    pub fn data_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_core_types()
    }
}

/// Options for a save
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub priority: Priority,
    /// Overrides the configured items per chunk
    pub chunk_size: Option<usize>,
    /// Chunk the record regardless of its handler or size
    pub force_large: bool,
}

impl SaveOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Options for a load
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub use_cache: bool,
    /// Overrides the cache's default TTL
    pub cache_ttl: Option<Duration>,
    pub priority: Priority,
    /// Cache dependencies attached to the cached result
    pub dependencies: Vec<String>,
    /// Return the type's default instead of null or an error
    pub fallback_to_default: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_ttl: None,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            fallback_to_default: false,
        }
    }
}

impl LoadOptions {
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    pub fn with_dependency<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.fallback_to_default = true;
        self
    }
}

/// Options that change what a load returns, in canonical form
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheKeyOptions<'a> {
    dependencies: Vec<&'a str>,
    fallback_to_default: bool,
    cache_ttl_ms: Option<u128>,
}

/// Cache key for a load: `cache_<dataType>_<options hash>`
pub fn cache_key(data_type: &str, options: &LoadOptions) -> String {
    let mut dependencies: Vec<&str> = options.dependencies.iter().map(String::as_str).collect();
    dependencies.sort_unstable();
    dependencies.dedup();

    let canonical = CacheKeyOptions {
        dependencies,
        fallback_to_default: options.fallback_to_default,
        cache_ttl_ms: options.cache_ttl.map(|ttl| ttl.as_millis()),
    };
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(&encoded));
    format!("cache_{data_type}_{}", &digest[..16])
}

/// What a cache invalidation targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePattern {
    Key(String),
    /// `*` wildcard pattern over whole keys
    Glob(String),
    Keys(Vec<String>),
}

impl From<&str> for CachePattern {
    fn from(pattern: &str) -> Self {
        if pattern.contains('*') {
            CachePattern::Glob(pattern.to_string())
        } else {
            CachePattern::Key(pattern.to_string())
        }
    }
}

impl From<Vec<String>> for CachePattern {
    fn from(keys: Vec<String>) -> Self {
        CachePattern::Keys(keys)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub data_type: String,
    pub key: String,
    /// Serialized payload size in bytes
    pub size: usize,
    /// Chunk count when the record was chunked
    pub chunks: Option<usize>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub data_type: String,
    pub removed_keys: usize,
    pub chunks: usize,
}

/// One entry of [`DataManager::save_batch`]
#[derive(Debug, Clone)]
pub struct BatchSave {
    pub data_type: String,
    pub data: Value,
    pub options: SaveOptions,
}

impl BatchSave {
    pub fn new<S: Into<String>>(data_type: S, data: Value) -> Self {
        Self {
            data_type: data_type.into(),
            data,
            options: SaveOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
struct OperationCounters {
    saves: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
    save_micros: AtomicU64,
    load_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub saves: u64,
    pub loads: u64,
    pub failures: u64,
    pub average_save_ms: f64,
    pub average_load_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub initialized: bool,
    pub namespace: String,
    pub handlers: BTreeMap<String, String>,
    pub cache: CacheStats,
    pub queue: QueueStatus,
    pub chunks: ChunkStats,
    pub operations: OperationStats,
    pub sync: Option<SyncStatus>,
}

/// Builder wiring a [`DataManager`] to its collaborators
pub struct DataManagerBuilder {
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<Cache>>,
    queue: Option<Arc<AsyncQueue>>,
    chunks: Option<Arc<ChunkProcessor>>,
    events: Option<EventBus>,
    sync: Option<Arc<dyn SyncCollaborator>>,
    config: EngineConfig,
    registry: HandlerRegistry,
    errors: Vec<String>,
}

impl DataManagerBuilder {
    pub fn cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn queue(mut self, queue: Arc<AsyncQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn chunk_processor(mut self, chunks: Arc<ChunkProcessor>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a cloud sync collaborator
    pub fn sync(mut self, sync: Arc<dyn SyncCollaborator>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Delegate a data type to an external store
    pub fn store(self, data_type: &str, store: Arc<dyn Persistable>) -> Self {
        self.handler(data_type, DataHandler::Store(store))
    }

    /// Always chunk `data_type`
    pub fn large_type(self, data_type: &str) -> Self {
        self.handler(data_type, DataHandler::Large)
    }

    pub fn handler(mut self, data_type: &str, handler: DataHandler) -> Self {
        if let Err(e) = self.registry.register(data_type, handler) {
            self.errors.push(e.to_string());
        }
        self
    }

    pub fn build(self) -> Result<DataManager> {
        let mut registry = self.registry;
        let mut errors = self.errors;
        for data_type in &self.config.large_types {
            if registry.handlers.contains_key(data_type) {
                continue;
            }
            if let Err(e) = registry.register(data_type, DataHandler::Large) {
                errors.push(e.to_string());
            }
        }
        if !errors.is_empty() {
            return Err(DataError::Validation { errors });
        }
        validate_data_type(&self.config.namespace)?;

        Ok(DataManager {
            backend: self.backend,
            cache: self.cache.unwrap_or_default(),
            queue: self.queue.unwrap_or_default(),
            chunks: self.chunks.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            sync: self.sync,
            config: self.config,
            registry,
            initialized: OnceCell::new(),
            counters: OperationCounters::default(),
        })
    }
}

/// Save/load engine over a storage backend
pub struct DataManager {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<Cache>,
    queue: Arc<AsyncQueue>,
    chunks: Arc<ChunkProcessor>,
    events: EventBus,
    sync: Option<Arc<dyn SyncCollaborator>>,
    config: EngineConfig,
    registry: HandlerRegistry,
    initialized: OnceCell<()>,
    counters: OperationCounters,
}

impl DataManager {
    pub fn builder(backend: Arc<dyn StorageBackend>) -> DataManagerBuilder {
        DataManagerBuilder {
            backend,
            cache: None,
            queue: None,
            chunks: None,
            events: None,
            sync: None,
            config: EngineConfig::default(),
            registry: HandlerRegistry::with_core_types(),
            errors: Vec::new(),
        }
    }

    /// Idempotent startup; every public operation calls it first
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                let prefix = format!("{}_", self.config.namespace);
                let existing = self.backend.keys(&prefix).await?;
                info!(
                    namespace = %self.config.namespace,
                    records = existing.len(),
                    handlers = self.registry.data_types().len(),
                    "data manager initialized"
                );
                self.events.emit(DataEvent::Initialized {
                    timestamp: Utc::now().timestamp_millis(),
                });
                Ok::<(), DataError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<AsyncQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }

    pub fn record_key(&self, data_type: &str) -> String {
        format!("{}_{data_type}", self.config.namespace)
    }

    pub fn chunk_key(&self, data_type: &str, index: usize) -> String {
        format!("{}_{data_type}_chunk_{index}", self.config.namespace)
    }

    pub fn metadata_key(&self, data_type: &str) -> String {
        format!("{}_{data_type}_metadata", self.config.namespace)
    }

    /// Save a record through the queue
    pub async fn save(&self, data_type: &str, data: Value, options: SaveOptions) -> Result<SaveResult> {
        self.queue
            .enqueue(options.priority, self.save_data_direct(data_type, &data, &options))
            .await
            .map_err(|e| self.fail(OperationTag::Save, data_type, e))
    }

    /// Load a record, reading through the cache unless `use_cache` is off
    pub async fn load(&self, data_type: &str, options: LoadOptions) -> Result<Value> {
        let outcome = async {
            self.initialize().await?;
            validate_data_type(data_type)?;

            if !options.use_cache {
                return self
                    .queue
                    .enqueue(options.priority, self.load_data_direct(data_type, &options))
                    .await;
            }

            let cache_options = CacheSetOptions {
                ttl: options.cache_ttl,
                priority: if options.priority == Priority::High {
                    Priority::High
                } else {
                    Priority::Normal
                },
                tags: vec![format!("dataType:{data_type}"), "data-load".to_string()],
                dependencies: options.dependencies.clone(),
            };
            self.cache
                .get_or_set(
                    &cache_key(data_type, &options),
                    || {
                        self.queue
                            .enqueue(options.priority, self.load_data_direct(data_type, &options))
                    },
                    cache_options,
                )
                .await
        }
        .await;

        outcome.map_err(|e| self.fail(OperationTag::Load, data_type, e))
    }

    /// Save a record as chunks plus a metadata record
    pub async fn save_large_data(
        &self,
        data_type: &str,
        data: Value,
        options: SaveOptions,
    ) -> Result<SaveResult> {
        let options = SaveOptions {
            force_large: true,
            ..options
        };
        self.queue
            .enqueue(options.priority, self.save_data_direct(data_type, &data, &options))
            .await
            .map_err(|e| self.fail(OperationTag::LargeDataSave, data_type, e))
    }

    /// Load a chunked record, falling back to a simple record when no chunk
    /// metadata exists. Bypasses the cache.
    pub async fn load_large_data(&self, data_type: &str, options: LoadOptions) -> Result<Value> {
        let outcome = async {
            self.initialize().await?;
            validate_data_type(data_type)?;
            let started = Instant::now();
            let value = self
                .queue
                .enqueue(options.priority, self.read_large(data_type))
                .await?;
            self.finish_load(data_type, started);
            Ok(value)
        }
        .await;

        outcome.map_err(|e| self.fail(OperationTag::LargeDataLoad, data_type, e))
    }

    /// Remove all chunks of a large record, then its metadata, in one
    /// sequential batch
    pub async fn delete_large_data(&self, data_type: &str) -> Result<DeleteResult> {
        let outcome = async {
            self.initialize().await?;
            validate_data_type(data_type)?;
            self.remove_large(data_type).await
        }
        .await;

        outcome.map_err(|e| self.fail(OperationTag::LargeDataDelete, data_type, e))
    }

    /// Remove a record, chunked or simple
    pub async fn delete(&self, data_type: &str) -> Result<DeleteResult> {
        let outcome = async {
            self.initialize().await?;
            validate_data_type(data_type)?;
            if let DataHandler::Store(_) = self.registry.resolve(data_type) {
                return Err(DataError::validation(format!(
                    "'{data_type}' is owned by an external store and cannot be deleted here"
                )));
            }

            let mut result = self.remove_large(data_type).await?;
            self.backend.remove(&self.record_key(data_type)).await?;
            result.removed_keys += 1;
            self.invalidate_data_type(data_type);
            info!(data_type, removed_keys = result.removed_keys, "record deleted");
            Ok(result)
        }
        .await;

        outcome.map_err(|e| self.fail(OperationTag::Delete, data_type, e))
    }

    /// Save several records through one queue batch. Each save succeeds or
    /// fails on its own.
    pub async fn save_batch(&self, operations: Vec<BatchSave>, options: BatchOptions) -> Vec<Result<SaveResult>> {
        let count = operations.len();
        let futures: Vec<BoxFuture<'_, Result<SaveResult>>> = operations
            .iter()
            .map(|op| {
                Box::pin(async move {
                    self.save_data_direct(&op.data_type, &op.data, &op.options)
                        .await
                        .map_err(|e| self.fail(OperationTag::Save, &op.data_type, e))
                }) as BoxFuture<'_, Result<SaveResult>>
            })
            .collect();

        self.queue
            .execute_batch(futures, options.with_metadata("batchSave", count))
            .await
    }

    /// Load several records through one queue batch, bypassing the cache
    pub async fn load_batch(&self, data_types: &[String], options: BatchOptions) -> Vec<Result<Value>> {
        let load_options = LoadOptions::uncached();
        let load_options = &load_options;
        let futures: Vec<BoxFuture<'_, Result<Value>>> = data_types
            .iter()
            .map(|data_type| {
                Box::pin(async move {
                    let loaded = async {
                        self.initialize().await?;
                        validate_data_type(data_type)?;
                        self.load_data_direct(data_type, load_options).await
                    }
                    .await;
                    loaded.map_err(|e| self.fail(OperationTag::Load, data_type, e))
                }) as BoxFuture<'_, Result<Value>>
            })
            .collect();

        self.queue
            .execute_batch(futures, options.with_metadata("batchLoad", data_types.len()))
            .await
    }

    /// Drop cached loads by key, `*` glob or key list
    pub fn invalidate_cache<P: Into<CachePattern>>(&self, pattern: P) -> Result<usize> {
        let removed = match pattern.into() {
            CachePattern::Key(key) => usize::from(self.cache.delete(&key)),
            CachePattern::Glob(glob) => self.cache.invalidate_matching(&glob)?,
            CachePattern::Keys(keys) => self.cache.delete_many(&keys),
        };
        debug!(removed, "cache invalidated");
        Ok(removed)
    }

    pub fn invalidate_cache_by_dependency(&self, dependency: &str) -> usize {
        self.cache.invalidate_by_dependency(dependency)
    }

    /// Run the attached sync collaborator
    pub async fn sync_to_cloud(&self) -> Result<SyncReport> {
        let Some(sync) = &self.sync else {
            return Err(DataError::NotAvailable("cloud sync".to_string()));
        };
        self.initialize().await?;

        match sync.sync().await {
            Ok(report) => {
                info!(synced = report.synced_types.len(), conflicts = report.conflicts, "cloud sync completed");
                self.events.emit(DataEvent::CloudSyncCompleted {
                    synced_types: report.synced_types.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                self.events.emit(DataEvent::CloudSyncFailed {
                    error: e.to_string(),
                });
                Err(self.fail(OperationTag::Sync, "cloud", e))
            }
        }
    }

    pub fn get_status(&self) -> ManagerStatus {
        let saves = self.counters.saves.load(Ordering::Relaxed);
        let loads = self.counters.loads.load(Ordering::Relaxed);
        let average_ms = |micros: &AtomicU64, count: u64| {
            if count == 0 {
                0.0
            } else {
                micros.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
            }
        };

        ManagerStatus {
            initialized: self.is_initialized(),
            namespace: self.config.namespace.clone(),
            handlers: self
                .registry
                .handlers
                .iter()
                .map(|(name, handler)| (name.clone(), handler.kind().to_string()))
                .collect(),
            cache: self.cache.stats(),
            queue: self.queue.status(),
            chunks: self.chunks.stats(),
            operations: OperationStats {
                saves,
                loads,
                failures: self.counters.failures.load(Ordering::Relaxed),
                average_save_ms: average_ms(&self.counters.save_micros, saves),
                average_load_ms: average_ms(&self.counters.load_micros, loads),
            },
            sync: self.sync.as_ref().map(|sync| sync.status()),
        }
    }

    /// Save without taking a queue slot; the caller holds one
    async fn save_data_direct(&self, data_type: &str, data: &Value, options: &SaveOptions) -> Result<SaveResult> {
        self.initialize().await?;
        validate_data_type(data_type)?;
        let started = Instant::now();

        if CORE_DATA_TYPES.contains(&data_type) && !data.is_object() {
            return Err(DataError::validation(format!(
                "{data_type} must be a JSON object"
            )));
        }

        let size = serde_json::to_vec(data)?.len();
        let key = self.record_key(data_type);
        let _guard = self.queue.lock_key(&key).await;

        let handler = self.registry.resolve(data_type);
        let chunked = match handler {
            DataHandler::Store(store) => {
                store.save(data).await?;
                None
            }
            DataHandler::Large => Some(self.write_large(data_type, data, options).await?),
            _ if options.force_large => Some(self.write_large(data_type, data, options).await?),
            DataHandler::Generic
                if size > self.config.large_threshold_bytes && (data.is_array() || data.is_object()) =>
            {
                Some(self.write_large(data_type, data, options).await?)
            }
            DataHandler::Generic => {
                self.backend.save(&key, data).await?;
                self.drop_stale_chunks(data_type).await?;
                None
            }
            DataHandler::Object => {
                self.backend.save(&key, data).await?;
                None
            }
        };

        self.invalidate_data_type(data_type);

        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        self.counters
            .save_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        observability::record(MetricEvent::Save);
        observability::record_latency("save", elapsed);
        self.events.emit(DataEvent::DataSaved {
            data_type: data_type.to_string(),
            size,
            duration_ms,
        });
        debug!(data_type, size, chunks = ?chunked, duration_ms, "record saved");

        Ok(SaveResult {
            data_type: data_type.to_string(),
            key,
            size,
            chunks: chunked,
            duration_ms,
        })
    }

    /// Load without taking a queue slot; the caller holds one
    async fn load_data_direct(&self, data_type: &str, options: &LoadOptions) -> Result<Value> {
        let started = Instant::now();
        let loaded = match self.registry.resolve(data_type) {
            DataHandler::Store(store) => store.load().await,
            DataHandler::Object => self
                .backend
                .load(&self.record_key(data_type))
                .await
                .map(|value| value.unwrap_or(Value::Null)),
            DataHandler::Generic | DataHandler::Large => self.read_large(data_type).await,
        };

        let value = match loaded {
            Ok(Value::Null) if options.fallback_to_default => default_data(data_type),
            Ok(value) => value,
            Err(e) if options.fallback_to_default => {
                warn!(data_type, error = %e, "load failed, returning default data");
                default_data(data_type)
            }
            Err(e) => return Err(e),
        };

        self.finish_load(data_type, started);
        Ok(value)
    }

    fn finish_load(&self, data_type: &str, started: Instant) {
        let elapsed = started.elapsed();
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .load_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        observability::record(MetricEvent::Load);
        observability::record_latency("load", elapsed);
        self.events.emit(DataEvent::DataLoaded {
            data_type: data_type.to_string(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    /// Write chunks, then metadata, then drop chunks left by a larger
    /// earlier save. Returns the chunk count.
    async fn write_large(&self, data_type: &str, data: &Value, options: &SaveOptions) -> Result<usize> {
        self.write_large_inner(data_type, data, options)
            .await
            .map_err(|e| e.tagged(OperationTag::LargeDataSave, data_type))
    }

    async fn write_large_inner(&self, data_type: &str, data: &Value, options: &SaveOptions) -> Result<usize> {
        let chunk_size = options
            .chunk_size
            .unwrap_or(self.config.chunk_size)
            .max(1);
        let (data_structure, total_items) = match data {
            Value::Array(items) => (DataStructure::Array, items.len()),
            Value::Object(map) => (DataStructure::Object, map.len()),
            _ => {
                return Err(DataError::validation(format!(
                    "large data for '{data_type}' must be an array or object"
                )))
            }
        };
        let total_chunks = total_items.div_ceil(chunk_size);
        if total_chunks > self.config.max_chunks {
            return Err(DataError::validation(format!(
                "'{data_type}' needs {total_chunks} chunks, limit is {}",
                self.config.max_chunks
            )));
        }

        let previous = self.read_metadata(data_type).await?;
        let checksum = chunk::checksum(data)?;
        let chunk_options = ChunkOptions {
            chunk_size,
            collect_results: false,
            ..ChunkOptions::from_engine(&self.config)
        }
        .parallel(true);
        let progress = |info: &ChunkInfo| {
            self.emit_progress(LargeDataOperation::Save, data_type, info.processed_items, total_items)
        };

        match data {
            Value::Array(items) => {
                self.chunks
                    .process_array_with_progress(
                        items,
                        &chunk_options,
                        |chunk, chunk_index, _info| {
                            self.write_chunk(data_type, chunk_index, Value::Array(chunk))
                        },
                        progress,
                    )
                    .await?;
            }
            Value::Object(map) => {
                self.chunks
                    .process_object_with_progress(
                        map,
                        &chunk_options,
                        |chunk, chunk_index, _info| async move {
                            self.write_chunk(data_type, chunk_index, Value::Object(chunk))
                                .await
                                .map(|_| Value::Null)
                        },
                        progress,
                    )
                    .await?;
            }
            _ => {}
        }

        let metadata = ChunkMetadata {
            total_chunks,
            data_structure,
            chunk_size,
            total_items,
            timestamp: Utc::now().timestamp_millis(),
            checksum: Some(checksum),
        };
        self.backend
            .save(&self.metadata_key(data_type), &serde_json::to_value(&metadata)?)
            .await?;

        if let Some(previous) = previous {
            for index in total_chunks..previous.total_chunks {
                let key = self.chunk_key(data_type, index);
                if let Err(e) = self.backend.remove(&key).await {
                    warn!(data_type, key = %key, error = %e, "failed to remove stale chunk");
                }
            }
        }

        info!(data_type, total_chunks, total_items, "large data saved");
        Ok(total_chunks)
    }

    async fn write_chunk(&self, data_type: &str, chunk_index: usize, data: Value) -> Result<()> {
        let record = serde_json::to_value(ChunkRecord { chunk_index, data })?;
        self.backend
            .save(&self.chunk_key(data_type, chunk_index), &record)
            .await
    }

    /// Read a chunked record, or the simple record when no metadata exists
    async fn read_large(&self, data_type: &str) -> Result<Value> {
        let Some(metadata) = self
            .read_metadata(data_type)
            .await
            .map_err(|e| tag_large_load(e, data_type))?
        else {
            return Ok(self
                .backend
                .load(&self.record_key(data_type))
                .await?
                .unwrap_or(Value::Null));
        };

        let indices: Vec<usize> = (0..metadata.total_chunks).collect();
        let chunk_options = ChunkOptions {
            chunk_size: 1,
            ..ChunkOptions::from_engine(&self.config)
        }
        .parallel(true);
        let items_per_chunk = metadata.chunk_size.max(1);
        let progress = |info: &ChunkInfo| {
            let processed = (info.processed_items * items_per_chunk).min(metadata.total_items);
            self.emit_progress(LargeDataOperation::Load, data_type, processed, metadata.total_items)
        };

        let batches = self
            .chunks
            .process_array_with_progress(
                &indices,
                &chunk_options,
                |batch, _, _| async move {
                    let mut records = Vec::with_capacity(batch.len());
                    for index in batch {
                        let key = self.chunk_key(data_type, index);
                        match self.backend.load(&key).await? {
                            Some(value) => records.push(serde_json::from_value::<ChunkRecord>(value)?),
                            None => {
                                return Err(DataError::reconstruction(
                                    data_type,
                                    format!("chunk {index} missing"),
                                ))
                            }
                        }
                    }
                    Ok(records)
                },
                progress,
            )
            .await
            .map_err(|e| tag_large_load(e, data_type))?;

        let records: Vec<ChunkRecord> = batches.into_iter().flatten().collect();
        chunk::reconstruct_large_data(data_type, &metadata, records)
            .map_err(|e| tag_large_load(e, data_type))
    }

    async fn read_metadata(&self, data_type: &str) -> Result<Option<ChunkMetadata>> {
        match self.backend.load(&self.metadata_key(data_type)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| DataError::reconstruction(data_type, format!("corrupt chunk metadata: {e}"))),
            None => Ok(None),
        }
    }

    async fn remove_large(&self, data_type: &str) -> Result<DeleteResult> {
        let Some(metadata) = self.read_metadata(data_type).await? else {
            debug!(data_type, "no chunk metadata to delete");
            return Ok(DeleteResult {
                data_type: data_type.to_string(),
                removed_keys: 0,
                chunks: 0,
            });
        };

        let mut keys: Vec<String> = (0..metadata.total_chunks)
            .map(|index| self.chunk_key(data_type, index))
            .collect();
        keys.push(self.metadata_key(data_type));

        let backend = &self.backend;
        let removals: Vec<BoxFuture<'_, Result<()>>> = keys
            .iter()
            .map(|key| Box::pin(async move { backend.remove(key).await }) as BoxFuture<'_, Result<()>>)
            .collect();

        let results = self
            .queue
            .execute_batch(
                removals,
                BatchOptions::sequential()
                    .with_priority(Priority::High)
                    .with_metadata("deleteLargeData", keys.len()),
            )
            .await;
        self.invalidate_data_type(data_type);

        let mut failures = results.into_iter().filter_map(|result| result.err());
        if let Some(first) = failures.next() {
            let remaining = failures.count();
            warn!(data_type, failed = remaining + 1, "some chunk removals failed");
            return Err(first.tagged(OperationTag::LargeDataDelete, data_type));
        }

        info!(data_type, chunks = metadata.total_chunks, "large data deleted");
        self.events.emit(DataEvent::LargeDataDeleted {
            data_type: data_type.to_string(),
            chunks: metadata.total_chunks,
        });
        Ok(DeleteResult {
            data_type: data_type.to_string(),
            removed_keys: keys.len(),
            chunks: metadata.total_chunks,
        })
    }

    /// A simple save replaces an earlier chunked one; remove the metadata
    /// first so readers fall back to the new record
    async fn drop_stale_chunks(&self, data_type: &str) -> Result<()> {
        let Some(metadata) = self.read_metadata(data_type).await? else {
            return Ok(());
        };
        self.backend.remove(&self.metadata_key(data_type)).await?;
        for index in 0..metadata.total_chunks {
            self.backend.remove(&self.chunk_key(data_type, index)).await?;
        }
        debug!(data_type, chunks = metadata.total_chunks, "replaced chunked record");
        Ok(())
    }

    fn invalidate_data_type(&self, data_type: &str) {
        self.cache.invalidate_by_tag(&format!("dataType:{data_type}"));
        self.cache.invalidate_by_dependency(data_type);
    }

    fn emit_progress(&self, operation: LargeDataOperation, data_type: &str, processed_items: usize, total_items: usize) {
        if !self.config.emit_progress {
            return;
        }
        let info = ChunkInfo {
            chunk_index: 0,
            total_chunks: 0,
            processed_items,
            total_items,
        };
        self.events.emit(DataEvent::LargeDataProgress {
            operation,
            data_type: data_type.to_string(),
            progress: info.progress(),
            processed_items,
            total_items,
        });
    }

    /// Tag, count and log a failed public operation
    fn fail(&self, tag: OperationTag, data_type: &str, err: DataError) -> DataError {
        let err = err.tagged(tag, data_type);
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        if matches!(err.root(), DataError::Storage { .. } | DataError::Io(_)) {
            observability::record(MetricEvent::StorageError);
        }

        let tag = err.tag().unwrap_or(tag);
        if err.is_validation() || matches!(err.root(), DataError::InvalidDataType(_)) {
            warn!(tag = %tag, data_type, error = %err, "operation rejected");
        } else {
            error!(tag = %tag, data_type, error = %err, "operation failed");
        }
        err
    }
}

fn tag_large_load(err: DataError, data_type: &str) -> DataError {
    match err.root() {
        DataError::Reconstruction { .. } => err.tagged(OperationTag::LargeDataReconstruction, data_type),
        _ => err.tagged(OperationTag::LargeDataLoad, data_type),
    }
}

/// Value returned for an absent record when a load asks for a fallback
fn default_data(data_type: &str) -> Value {
    if CORE_DATA_TYPES.contains(&data_type) {
        json!({})
    } else {
        Value::Null
    }
}
