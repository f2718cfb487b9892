//! Root object owning the engine and its collaborators

use std::sync::Arc;

use tracing::info;

use crate::cache::Cache;
use crate::chunk::ChunkProcessor;
use crate::config::DataConfig;
use crate::events::EventBus;
use crate::export::ExportManager;
use crate::import::{ImportManager, StructuralValidator};
use crate::manager::DataManager;
use crate::queue::AsyncQueue;
use crate::storage::{backend_from_config, StorageBackend};
use crate::Result;

/// Wires one cache, queue, chunk processor and event bus into a
/// [`DataManager`] plus its importer and exporter
pub struct DataContext {
    config: DataConfig,
    manager: Arc<DataManager>,
    importer: ImportManager,
    exporter: ExportManager,
}

impl DataContext {
    /// Build a context over the backend named in `config.storage`
    pub fn from_config(config: DataConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend_from_config(&config.storage)?;
        Self::with_backend(config, backend)
    }

    /// Build a context over an existing backend
    pub fn with_backend(config: DataConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let manager = DataManager::builder(backend)
            .cache(Arc::new(Cache::new(&config.cache)))
            .queue(Arc::new(AsyncQueue::new(&config.queue)))
            .chunk_processor(Arc::new(ChunkProcessor::new()))
            .events(EventBus::new())
            .config(config.engine.clone())
            .build()?;
        let manager = Arc::new(manager);

        let importer = ImportManager::new(Arc::clone(&manager), config.import.clone())
            .with_validator(Arc::new(StructuralValidator));
        let exporter = ExportManager::new(Arc::clone(&manager));

        info!(
            namespace = %config.engine.namespace,
            backend = ?config.storage.backend,
            "data context ready"
        );
        Ok(Self {
            config,
            manager,
            importer,
            exporter,
        })
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    pub fn importer(&self) -> &ImportManager {
        &self.importer
    }

    pub fn exporter(&self) -> &ExportManager {
        &self.exporter
    }

    /// Stop admitting queued work and drop cached reads
    pub fn shutdown(&self) {
        self.manager.queue().close();
        self.manager.cache().clear();
        info!("data context shut down");
    }
}
