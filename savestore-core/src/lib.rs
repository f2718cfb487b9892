/*!
# Savestore Core Engine

Chunked persistence and import reconciliation for game save data.

The engine moves structured save data between callers and a key-value
storage backend:

- a read cache with TTLs, tags and dependency-based invalidation
- a bounded, priority-aware operation queue with per-key write locks
- a chunk processor that splits large arrays and objects into bounded
  slices and reconstructs them on read
- an import pipeline that validates bundles, detects field-level conflicts
  against stored data and resolves them with a chosen strategy

## Architecture

Storage is a port: the engine only depends on [`StorageBackend`]
(`save`, `load`, `remove`). [`MemoryStorage`] and [`LocalFileStorage`] are
the bundled adapters. [`DataContext`] owns one instance of every
collaborator and hands them to the [`DataManager`] at construction.

## Usage

```rust,no_run
use savestore_core::{DataConfig, DataContext, LoadOptions, ResolutionStrategy, SaveOptions};
use serde_json::json;

# async fn run() -> savestore_core::Result<()> {
let context = DataContext::from_config(DataConfig::default())?;
let manager = context.manager();

manager.save("playerData", json!({"ap": 100}), SaveOptions::default()).await?;
let player = manager.load("playerData", LoadOptions::default()).await?;

let bundle = context.exporter().export_data(&[]).await?.to_value()?;
let outcome = context
    .importer()
    .import_data(&bundle, ResolutionStrategy::Merge, Default::default())
    .await?;
assert!(outcome.success);
# Ok(())
# }
```
*/

pub mod cache;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod export;
pub mod import;
pub mod manager;
pub mod observability;
pub mod queue;
pub mod storage;
pub mod sync;

pub use cache::{Cache, CacheSetOptions, CacheStats};
pub use chunk::{ChunkInfo, ChunkMetadata, ChunkOptions, ChunkProcessor, ChunkRecord, DataStructure};
pub use config::{CacheConfig, DataConfig, EngineConfig, ImportConfig, QueueConfig, StorageBackendKind, StorageConfig};
pub use context::DataContext;
pub use error::{DataError, OperationTag, Result};
pub use events::{DataEvent, EventBus, LargeDataOperation};
pub use export::{ExportManager, SaveBundle};
pub use import::{
    ConflictKind, ConflictRecord, DataValidator, ImportManager, ImportOptions, ImportOutcome, ImportPreview,
    ResolutionStrategy, Selection, StructuralValidator,
};
pub use manager::{
    BatchSave, CachePattern, DataHandler, DataManager, DeleteResult, LoadOptions, ManagerStatus, Persistable,
    SaveOptions, SaveResult,
};
pub use observability::init_observability;
pub use queue::{AsyncQueue, BatchOptions, Priority};
pub use storage::{LocalFileStorage, MemoryStorage, StorageBackend};
pub use sync::{SyncCollaborator, SyncReport, SyncStatus};
