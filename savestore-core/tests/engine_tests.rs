/*!
Integration tests for the persistence engine over the in-memory backend.
*/

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use savestore_core::chunk::{self, reconstruct_large_data};
use savestore_core::{
    BatchOptions, BatchSave, ChunkMetadata, ChunkRecord, DataError, DataEvent, DataManager, DataStructure,
    EngineConfig, LargeDataOperation, LoadOptions, LocalFileStorage, MemoryStorage, OperationTag, Persistable, Result, SaveOptions,
    StorageBackend, SyncCollaborator, SyncReport, SyncStatus,
};

fn engine(backend: &Arc<MemoryStorage>) -> DataManager {
    DataManager::builder(backend.clone())
        .config(EngineConfig {
            chunk_size: 10,
            ..EngineConfig::default()
        })
        .large_type("stageLog")
        .build()
        .unwrap()
}

fn items(count: usize) -> Value {
    Value::Array((0..count).map(|i| json!({"stage": i, "score": i * 10})).collect())
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<DataEvent>) -> Vec<DataEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_delete_large_data_issues_one_remove_per_key() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    let saved = manager
        .save("stageLog", items(25), SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(saved.chunks, Some(3));

    let mut events = manager.subscribe();
    let before = backend.op_counts();
    let deleted = manager.delete_large_data("stageLog").await.unwrap();
    let after = backend.op_counts();

    assert_eq!(after.removes - before.removes, 4);
    assert_eq!(deleted.chunks, 3);
    assert_eq!(deleted.removed_keys, 4);
    assert!(!backend.contains("bubblePop_stageLog_metadata"));
    assert!(!backend.contains("bubblePop_stageLog_chunk_0"));
    assert!(drain(&mut events).contains(&DataEvent::LargeDataDeleted {
        data_type: "stageLog".to_string(),
        chunks: 3,
    }));
}

#[tokio::test]
async fn test_large_array_round_trip() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    let data = items(95);

    let saved = manager
        .save_large_data("stageLog", data.clone(), SaveOptions::default().with_chunk_size(7))
        .await
        .unwrap();
    assert_eq!(saved.chunks, Some(14));
    assert_eq!(saved.key, "bubblePop_stageLog");
    assert!(backend.contains("bubblePop_stageLog_chunk_13"));

    let metadata: ChunkMetadata =
        serde_json::from_value(backend.load("bubblePop_stageLog_metadata").await.unwrap().unwrap()).unwrap();
    assert_eq!(metadata.total_chunks, 14);
    assert_eq!(metadata.total_items, 95);
    assert_eq!(metadata.data_structure, DataStructure::Array);

    let loaded = manager
        .load_large_data("stageLog", LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(loaded, data);
    assert_eq!(manager.load("stageLog", LoadOptions::default()).await.unwrap(), data);
}

#[tokio::test]
async fn test_float_chunks_survive_local_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = DataManager::builder(Arc::new(LocalFileStorage::with_base_dir(dir.path())))
        .config(EngineConfig {
            chunk_size: 500,
            ..EngineConfig::default()
        })
        .large_type("stageLog")
        .build()
        .unwrap();

    let mut rng = StdRng::seed_from_u64(17);
    let data = Value::Array(
        (0..5_000)
            .map(|_| json!(rng.gen::<f64>() * 10f64.powi(rng.gen_range(-8..12))))
            .collect(),
    );
    manager
        .save_large_data("stageLog", data.clone(), SaveOptions::default())
        .await
        .unwrap();

    let loaded = manager
        .load_large_data("stageLog", LoadOptions::uncached())
        .await
        .unwrap();
    assert_eq!(loaded, data);
}

#[tokio::test]
async fn test_large_object_round_trip() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    let mut object = serde_json::Map::new();
    for i in 0..33 {
        object.insert(format!("item_{i:02}"), json!({"owned": i % 2 == 0}));
    }
    let data = Value::Object(object);

    let saved = manager
        .save_large_data("inventory", data.clone(), SaveOptions::default())
        .await
        .unwrap();
    assert_eq!(saved.chunks, Some(4));

    let loaded = manager
        .load_large_data("inventory", LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(loaded, data);
}

#[tokio::test]
async fn test_empty_large_array() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);

    let saved = manager.save("stageLog", json!([]), SaveOptions::default()).await.unwrap();
    assert_eq!(saved.chunks, Some(0));
    assert_eq!(
        manager.load_large_data("stageLog", LoadOptions::default()).await.unwrap(),
        json!([])
    );
}

#[tokio::test]
async fn test_shrinking_save_removes_stale_chunks() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);

    manager.save("stageLog", items(30), SaveOptions::default()).await.unwrap();
    assert!(backend.contains("bubblePop_stageLog_chunk_2"));

    manager.save("stageLog", items(12), SaveOptions::default()).await.unwrap();
    assert!(backend.contains("bubblePop_stageLog_chunk_1"));
    assert!(!backend.contains("bubblePop_stageLog_chunk_2"));
    assert_eq!(
        manager.load("stageLog", LoadOptions::uncached()).await.unwrap(),
        items(12)
    );
}

#[tokio::test]
async fn test_missing_chunk_fails_reconstruction() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    manager.save("stageLog", items(25), SaveOptions::default()).await.unwrap();

    backend.remove("bubblePop_stageLog_chunk_1").await.unwrap();

    let err = manager
        .load_large_data("stageLog", LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.tag(), Some(OperationTag::LargeDataReconstruction));
    assert!(matches!(err.root(), DataError::Reconstruction { .. }));
}

#[tokio::test]
async fn test_tampered_chunk_fails_checksum() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    manager.save("stageLog", items(25), SaveOptions::default()).await.unwrap();

    let mut reversed = items(10).as_array().unwrap().clone();
    reversed.reverse();
    let forged = json!({"chunkIndex": 0, "data": reversed});
    backend.save("bubblePop_stageLog_chunk_0", &forged).await.unwrap();

    let err = manager
        .load("stageLog", LoadOptions::uncached())
        .await
        .unwrap_err();
    assert_eq!(err.tag(), Some(OperationTag::LargeDataReconstruction));
}

#[tokio::test]
async fn test_progress_events_are_monotonic() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    let mut events = manager.subscribe();

    manager.save("stageLog", items(55), SaveOptions::default()).await.unwrap();

    let progress: Vec<(usize, u8)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DataEvent::LargeDataProgress {
                operation: LargeDataOperation::Save,
                processed_items,
                progress,
                total_items,
                ..
            } => {
                assert_eq!(total_items, 55);
                Some((processed_items, progress))
            }
            _ => None,
        })
        .collect();

    assert_eq!(progress.len(), 6);
    assert!(progress.windows(2).all(|pair| pair[0].0 <= pair[1].0));
    assert_eq!(progress.last(), Some(&(55, 100)));
}

#[test]
fn test_reconstruction_ignores_completion_order() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let len: usize = rng.gen_range(0..200);
        let chunk_size: usize = rng.gen_range(1..25);
        let data: Vec<Value> = (0..len).map(|i| json!(i)).collect();

        let mut records: Vec<ChunkRecord> = data
            .chunks(chunk_size)
            .enumerate()
            .map(|(chunk_index, slice)| ChunkRecord {
                chunk_index,
                data: Value::Array(slice.to_vec()),
            })
            .collect();
        records.shuffle(&mut rng);

        let expected = Value::Array(data);
        let metadata = ChunkMetadata {
            total_chunks: len.div_ceil(chunk_size),
            data_structure: DataStructure::Array,
            chunk_size,
            total_items: len,
            timestamp: 0,
            checksum: Some(chunk::checksum(&expected).unwrap()),
        };
        assert_eq!(records.len(), metadata.total_chunks);
        assert_eq!(reconstruct_large_data("shuffled", &metadata, records).unwrap(), expected);
    }
}

#[tokio::test]
async fn test_generic_type_is_chunked_above_threshold() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = DataManager::builder(backend.clone())
        .config(EngineConfig {
            chunk_size: 10,
            large_threshold_bytes: 200,
            ..EngineConfig::default()
        })
        .build()
        .unwrap();

    let big = manager.save("replays", items(40), SaveOptions::default()).await.unwrap();
    assert_eq!(big.chunks, Some(4));
    assert!(backend.contains("bubblePop_replays_metadata"));

    let small = manager.save("replays", items(1), SaveOptions::default()).await.unwrap();
    assert_eq!(small.chunks, None);
    assert!(!backend.contains("bubblePop_replays_metadata"));
    assert!(!backend.contains("bubblePop_replays_chunk_0"));
    assert_eq!(manager.load("replays", LoadOptions::default()).await.unwrap(), items(1));
}

#[tokio::test]
async fn test_cached_load_skips_backend() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    manager
        .save("settings", json!({"volume": 3}), SaveOptions::default())
        .await
        .unwrap();

    let before = backend.op_counts().loads;
    manager.load("settings", LoadOptions::default()).await.unwrap();
    manager.load("settings", LoadOptions::default()).await.unwrap();
    assert_eq!(backend.op_counts().loads - before, 1);
    assert_eq!(manager.get_status().cache.hits, 1);

    // A save invalidates every cached load of the type
    manager
        .save("settings", json!({"volume": 7}), SaveOptions::default())
        .await
        .unwrap();
    let reloaded = manager.load("settings", LoadOptions::default()).await.unwrap();
    assert_eq!(reloaded, json!({"volume": 7}));
    assert_eq!(backend.op_counts().loads - before, 2);
}

#[tokio::test]
async fn test_dependency_invalidation() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    manager.save("settings", json!({"volume": 3}), SaveOptions::default()).await.unwrap();

    let dependent = LoadOptions::default().with_dependency("playerData");
    manager.load("settings", dependent.clone()).await.unwrap();
    manager.load("settings", LoadOptions::default()).await.unwrap();
    assert_eq!(manager.cache().len(), 2);

    manager.save("playerData", json!({"ap": 1}), SaveOptions::default()).await.unwrap();
    assert_eq!(manager.cache().len(), 1);

    assert_eq!(manager.invalidate_cache("cache_settings_*").unwrap(), 1);
    assert!(manager.cache().is_empty());
}

#[tokio::test]
async fn test_batches_isolate_failures() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);

    let results = manager
        .save_batch(
            vec![
                BatchSave::new("settings", json!({"volume": 1})),
                BatchSave::new("statistics", json!("not an object")),
                BatchSave::new("notes", json!(["a", "b"])),
            ],
            BatchOptions::default(),
        )
        .await;
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().tag(), Some(OperationTag::Save));
    assert!(results[2].is_ok());

    let types = vec!["notes".to_string(), "settings".to_string(), "missing".to_string()];
    let loaded = manager.load_batch(&types, BatchOptions::sequential()).await;
    assert_eq!(loaded[0].as_ref().unwrap(), &json!(["a", "b"]));
    assert_eq!(loaded[1].as_ref().unwrap(), &json!({"volume": 1}));
    assert_eq!(loaded[2].as_ref().unwrap(), &Value::Null);
}

#[tokio::test]
async fn test_delete_simple_record() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    manager.save("settings", json!({"volume": 1}), SaveOptions::default()).await.unwrap();
    manager.load("settings", LoadOptions::default()).await.unwrap();

    manager.delete("settings").await.unwrap();
    assert!(!backend.contains("bubblePop_settings"));
    assert_eq!(manager.load("settings", LoadOptions::default()).await.unwrap(), Value::Null);
}

#[derive(Default)]
struct ProfileStore {
    profile: Mutex<Value>,
}

#[async_trait]
impl Persistable for ProfileStore {
    async fn save(&self, data: &Value) -> Result<()> {
        *self.profile.lock().unwrap() = data.clone();
        Ok(())
    }

    async fn load(&self) -> Result<Value> {
        Ok(self.profile.lock().unwrap().clone())
    }
}

#[tokio::test]
async fn test_external_store_owns_its_type() {
    let backend = Arc::new(MemoryStorage::new());
    let store = Arc::new(ProfileStore::default());
    let manager = DataManager::builder(backend.clone())
        .store("playerData", store.clone())
        .build()
        .unwrap();

    manager
        .save("playerData", json!({"ap": 42}), SaveOptions::default())
        .await
        .unwrap();
    assert!(!backend.contains("bubblePop_playerData"));
    assert_eq!(*store.profile.lock().unwrap(), json!({"ap": 42}));
    assert_eq!(
        manager.load("playerData", LoadOptions::uncached()).await.unwrap(),
        json!({"ap": 42})
    );
    assert!(manager.delete("playerData").await.is_err());
}

struct FixedSync;

#[async_trait]
impl SyncCollaborator for FixedSync {
    async fn sync(&self) -> Result<SyncReport> {
        Ok(SyncReport {
            synced_types: vec!["playerData".to_string()],
            conflicts: 0,
        })
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            connected: true,
            ..SyncStatus::default()
        }
    }
}

#[tokio::test]
async fn test_sync_reports_through_events() {
    let manager = DataManager::builder(Arc::new(MemoryStorage::new()))
        .sync(Arc::new(FixedSync))
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    let report = manager.sync_to_cloud().await.unwrap();
    assert_eq!(report.synced_types, vec!["playerData"]);
    assert!(manager.get_status().sync.unwrap().connected);
    assert!(drain(&mut events).contains(&DataEvent::CloudSyncCompleted {
        synced_types: vec!["playerData".to_string()],
    }));
}

#[tokio::test]
async fn test_status_reports_operations() {
    let backend = Arc::new(MemoryStorage::new());
    let manager = engine(&backend);
    assert!(!manager.get_status().initialized);

    manager.save("settings", json!({}), SaveOptions::default()).await.unwrap();
    let _ = manager.save("settings", json!(1), SaveOptions::default()).await;

    let status = manager.get_status();
    assert!(status.initialized);
    assert_eq!(status.namespace, "bubblePop");
    assert_eq!(status.operations.saves, 1);
    assert_eq!(status.operations.failures, 1);
    assert_eq!(status.handlers.get("stageLog").map(String::as_str), Some("large"));
    assert_eq!(status.queue.running, 0);
}
