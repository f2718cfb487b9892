/*!
Chunk processor for large arrays and objects.

Large records are split into fixed-size slices, each handed to an async
worker. Workers may run concurrently; results are always returned in chunk
order. [`reconstruct_large_data`] reverses the split from persisted chunk
records.
*/

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::{DataError, Result};

/// Shape of the record a set of chunks was cut from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStructure {
    Array,
    Object,
}

/// Metadata record persisted after all chunks of a large record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub total_chunks: usize,
    pub data_structure: DataStructure,
    #[serde(default)]
    pub chunk_size: usize,
    #[serde(default)]
    pub total_items: usize,
    /// Unix milliseconds of the save
    #[serde(default)]
    pub timestamp: i64,
    /// SHA-256 of the serialized record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// One persisted chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub chunk_index: usize,
    pub data: Value,
}

/// Position of a chunk within its run, handed to workers and progress
/// callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Items in chunks that have completed so far
    pub processed_items: usize,
    pub total_items: usize,
}

impl ChunkInfo {
    /// Completion as a whole percentage
    pub fn progress(&self) -> u8 {
        if self.total_items == 0 {
            return 100;
        }
        ((self.processed_items * 100) / self.total_items).min(100) as u8
    }
}

/// Options for a chunked run
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    /// Keep per-chunk results; when false the result is empty
    pub collect_results: bool,
    pub parallel: bool,
    /// Upper bound on concurrently running workers when `parallel` is set
    pub max_parallel: usize,
    /// Object mode only: shallow-merge object results into one object
    pub merge_results: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            collect_results: true,
            parallel: false,
            max_parallel: 4,
            merge_results: false,
        }
    }
}

impl ChunkOptions {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_parallel: config.max_parallel_chunks,
            ..Self::default()
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Counters across all runs of one processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStats {
    pub runs: u64,
    pub chunks_processed: u64,
    pub items_processed: u64,
    pub failures: u64,
}

/// Splits records into chunks and drives async workers over them
#[derive(Debug, Default)]
pub struct ChunkProcessor {
    runs: AtomicU64,
    chunks_processed: AtomicU64,
    items_processed: AtomicU64,
    failures: AtomicU64,
}

impl ChunkProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `worker` over `items` in slices of `chunk_size`
    pub async fn process_array<T, R, F, Fut>(
        &self,
        items: &[T],
        options: &ChunkOptions,
        worker: F,
    ) -> Result<Vec<R>>
    where
        T: Clone,
        F: Fn(Vec<T>, usize, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.process_array_with_progress(items, options, worker, |_| {})
            .await
    }

    /// [`process_array`](Self::process_array) with a callback after each
    /// completed chunk. `processed_items` never decreases between calls.
    pub async fn process_array_with_progress<T, R, F, Fut, P>(
        &self,
        items: &[T],
        options: &ChunkOptions,
        worker: F,
        progress: P,
    ) -> Result<Vec<R>>
    where
        T: Clone,
        F: Fn(Vec<T>, usize, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<R>>,
        P: FnMut(&ChunkInfo),
    {
        let chunks: Vec<Vec<T>> = items
            .chunks(options.chunk_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        self.run(chunks, items.len(), options, worker, progress).await
    }

    /// Run `worker` over an object in slices of `chunk_size` keys
    ///
    /// With `merge_results` the object results are shallow-merged in chunk
    /// order; otherwise the per-chunk results are returned as an array.
    pub async fn process_object<F, Fut>(
        &self,
        object: &Map<String, Value>,
        options: &ChunkOptions,
        worker: F,
    ) -> Result<Value>
    where
        F: Fn(Map<String, Value>, usize, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        self.process_object_with_progress(object, options, worker, |_| {})
            .await
    }

    pub async fn process_object_with_progress<F, Fut, P>(
        &self,
        object: &Map<String, Value>,
        options: &ChunkOptions,
        worker: F,
        progress: P,
    ) -> Result<Value>
    where
        F: Fn(Map<String, Value>, usize, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<Value>>,
        P: FnMut(&ChunkInfo),
    {
        let chunks = split_object(object, options.chunk_size);
        let results = self.run(chunks, object.len(), options, worker, progress).await?;

        if options.merge_results {
            Ok(Value::Object(merge_objects(results)))
        } else {
            Ok(Value::Array(results))
        }
    }

    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            runs: self.runs.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    async fn run<C, R, F, Fut, P>(
        &self,
        chunks: Vec<C>,
        total_items: usize,
        options: &ChunkOptions,
        worker: F,
        mut progress: P,
    ) -> Result<Vec<R>>
    where
        C: ChunkLen,
        F: Fn(C, usize, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<R>>,
        P: FnMut(&ChunkInfo),
    {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let total_chunks = chunks.len();
        if total_chunks == 0 {
            return Ok(Vec::new());
        }

        let concurrency = if options.parallel {
            options.max_parallel.max(1)
        } else {
            1
        };
        debug!(total_chunks, total_items, concurrency, "processing chunks");

        let processed = AtomicUsize::new(0);
        let processed = &processed;
        let worker = &worker;

        let mut completions = stream::iter(chunks.into_iter().enumerate())
            .map(|(chunk_index, chunk)| {
                let len = chunk.item_count();
                let info = ChunkInfo {
                    chunk_index,
                    total_chunks,
                    processed_items: processed.load(Ordering::SeqCst),
                    total_items,
                };
                let fut = worker(chunk, chunk_index, info);
                async move { (chunk_index, len, fut.await) }
            })
            .buffer_unordered(concurrency);

        let mut results: Vec<(usize, R)> = Vec::with_capacity(total_chunks);
        while let Some((chunk_index, len, outcome)) = completions.next().await {
            match outcome {
                Ok(result) => {
                    let done = processed.fetch_add(len, Ordering::SeqCst) + len;
                    self.chunks_processed.fetch_add(1, Ordering::Relaxed);
                    self.items_processed.fetch_add(len as u64, Ordering::Relaxed);
                    progress(&ChunkInfo {
                        chunk_index,
                        total_chunks,
                        processed_items: done,
                        total_items,
                    });
                    if options.collect_results {
                        results.push((chunk_index, result));
                    }
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(chunk_index, total_chunks, error = %e, "chunk worker failed");
                    return Err(e);
                }
            }
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }
}

trait ChunkLen {
    fn item_count(&self) -> usize;
}

impl<T> ChunkLen for Vec<T> {
    fn item_count(&self) -> usize {
        self.len()
    }
}

impl ChunkLen for Map<String, Value> {
    fn item_count(&self) -> usize {
        self.len()
    }
}

/// Split an object into maps of at most `chunk_size` keys, in key order
pub fn split_object(object: &Map<String, Value>, chunk_size: usize) -> Vec<Map<String, Value>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(object.len().div_ceil(chunk_size));
    let mut current = Map::new();
    for (key, value) in object {
        current.insert(key.clone(), value.clone());
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn merge_objects(results: Vec<Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for result in results {
        if let Value::Object(map) = result {
            merged.extend(map);
        }
    }
    merged
}

/// Hex SHA-256 of a value's compact JSON serialization
pub fn checksum(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Rebuild a large record from its metadata and chunk records
///
/// Chunks may arrive in any order. The chunk count, the index sequence and,
/// when recorded, the item count and checksum must all match the metadata.
pub fn reconstruct_large_data(
    data_type: &str,
    metadata: &ChunkMetadata,
    mut chunks: Vec<ChunkRecord>,
) -> Result<Value> {
    if chunks.len() != metadata.total_chunks {
        return Err(DataError::reconstruction(
            data_type,
            format!(
                "expected {} chunks, found {}",
                metadata.total_chunks,
                chunks.len()
            ),
        ));
    }

    chunks.sort_by_key(|chunk| chunk.chunk_index);
    if let Some((position, chunk)) = chunks
        .iter()
        .enumerate()
        .find(|(position, chunk)| chunk.chunk_index != *position)
    {
        return Err(DataError::reconstruction(
            data_type,
            format!("chunk {position} missing (found index {})", chunk.chunk_index),
        ));
    }

    let data = match metadata.data_structure {
        DataStructure::Array => {
            let mut items = Vec::with_capacity(metadata.total_items);
            for chunk in chunks {
                match chunk.data {
                    Value::Array(part) => items.extend(part),
                    _ => {
                        return Err(DataError::reconstruction(
                            data_type,
                            format!("chunk {} is not an array", chunk.chunk_index),
                        ))
                    }
                }
            }
            if metadata.total_items != 0 && items.len() != metadata.total_items {
                return Err(DataError::reconstruction(
                    data_type,
                    format!(
                        "expected {} items, reassembled {}",
                        metadata.total_items,
                        items.len()
                    ),
                ));
            }
            Value::Array(items)
        }
        DataStructure::Object => {
            let mut object = Map::new();
            for chunk in chunks {
                match chunk.data {
                    Value::Object(part) => object.extend(part),
                    _ => {
                        return Err(DataError::reconstruction(
                            data_type,
                            format!("chunk {} is not an object", chunk.chunk_index),
                        ))
                    }
                }
            }
            Value::Object(object)
        }
    };

    if let Some(expected) = &metadata.checksum {
        let actual = checksum(&data)?;
        if &actual != expected {
            return Err(DataError::reconstruction(data_type, "checksum mismatch"));
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn options(chunk_size: usize) -> ChunkOptions {
        ChunkOptions::default().with_chunk_size(chunk_size)
    }

    #[tokio::test]
    async fn test_empty_input_never_calls_worker() {
        let processor = ChunkProcessor::new();
        let items: Vec<u32> = Vec::new();
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let results = processor
            .process_array(&items, &options(10), move |_chunk, _index, _info| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(processor.stats().chunks_processed, 0);
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceiling() {
        let processor = ChunkProcessor::new();
        let items: Vec<u32> = (0..2501).collect();

        let sizes = processor
            .process_array(&items, &options(1000), |chunk, _index, info| async move {
                assert_eq!(info.total_chunks, 3);
                assert_eq!(info.total_items, 2501);
                Ok(chunk.len())
            })
            .await
            .unwrap();

        assert_eq!(sizes, vec![1000, 1000, 501]);
    }

    #[tokio::test]
    async fn test_parallel_results_are_in_chunk_order() {
        let processor = ChunkProcessor::new();
        let items: Vec<u64> = (0..50).collect();
        let opts = options(5).parallel(true);

        let results = processor
            .process_array(&items, &opts, |chunk, index, _info| async move {
                // Early chunks finish last
                tokio::time::sleep(Duration::from_millis(20 - index as u64 * 2)).await;
                Ok(chunk)
            })
            .await
            .unwrap();

        let flat: Vec<u64> = results.into_iter().flatten().collect();
        assert_eq!(flat, items);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let processor = ChunkProcessor::new();
        let items: Vec<u32> = (0..95).collect();
        let seen = Mutex::new(Vec::new());
        let opts = options(10).parallel(true);

        processor
            .process_array_with_progress(
                &items,
                &opts,
                |chunk, index, _info| async move {
                    tokio::time::sleep(Duration::from_millis((index % 3) as u64)).await;
                    Ok(chunk.len())
                },
                |info| seen.lock().unwrap().push(info.processed_items),
            )
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 95);
    }

    #[tokio::test]
    async fn test_worker_failure_aborts_run() {
        let processor = ChunkProcessor::new();
        let items: Vec<u32> = (0..30).collect();

        let result = processor
            .process_array(&items, &options(10), |_chunk, index, _info| async move {
                if index == 1 {
                    Err(DataError::storage("save", "chunk_1", "disk full"))
                } else {
                    Ok(index)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(processor.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_collect_results_off_returns_empty() {
        let processor = ChunkProcessor::new();
        let items: Vec<u32> = (0..30).collect();
        let opts = ChunkOptions {
            collect_results: false,
            ..options(10)
        };

        let results = processor
            .process_array(&items, &opts, |chunk, _, _| async move { Ok(chunk.len()) })
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(processor.stats().items_processed, 30);
    }

    #[tokio::test]
    async fn test_process_object_merge_and_array_modes() {
        let processor = ChunkProcessor::new();
        let object = json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5});
        let object = object.as_object().unwrap();

        let merged = processor
            .process_object(
                object,
                &ChunkOptions {
                    merge_results: true,
                    ..options(2)
                },
                |chunk, _, _| async move { Ok(Value::Object(chunk)) },
            )
            .await
            .unwrap();
        assert_eq!(&merged, &Value::Object(object.clone()));

        let per_chunk = processor
            .process_object(object, &options(2), |chunk, index, _| async move {
                Ok(json!({"index": index, "keys": chunk.len()}))
            })
            .await
            .unwrap();
        assert_eq!(
            per_chunk,
            json!([{"index": 0, "keys": 2}, {"index": 1, "keys": 2}, {"index": 2, "keys": 1}])
        );
    }

    fn metadata_for(data: &Value, structure: DataStructure, total_chunks: usize, total_items: usize) -> ChunkMetadata {
        ChunkMetadata {
            total_chunks,
            data_structure: structure,
            chunk_size: 2,
            total_items,
            timestamp: 0,
            checksum: Some(checksum(data).unwrap()),
        }
    }

    #[test]
    fn test_reconstruct_sorts_chunks() {
        let data = json!([1, 2, 3, 4, 5]);
        let metadata = metadata_for(&data, DataStructure::Array, 3, 5);
        let chunks = vec![
            ChunkRecord { chunk_index: 2, data: json!([5]) },
            ChunkRecord { chunk_index: 0, data: json!([1, 2]) },
            ChunkRecord { chunk_index: 1, data: json!([3, 4]) },
        ];

        assert_eq!(reconstruct_large_data("foo", &metadata, chunks).unwrap(), data);
    }

    #[test]
    fn test_reconstruct_object() {
        let data = json!({"a": 1, "b": 2, "c": 3});
        let metadata = metadata_for(&data, DataStructure::Object, 2, 3);
        let chunks = vec![
            ChunkRecord { chunk_index: 1, data: json!({"c": 3}) },
            ChunkRecord { chunk_index: 0, data: json!({"a": 1, "b": 2}) },
        ];

        assert_eq!(reconstruct_large_data("foo", &metadata, chunks).unwrap(), data);
    }

    #[test]
    fn test_reconstruct_rejects_missing_chunk() {
        let data = json!([1, 2, 3]);
        let metadata = metadata_for(&data, DataStructure::Array, 2, 3);

        let err = reconstruct_large_data(
            "foo",
            &metadata,
            vec![ChunkRecord { chunk_index: 0, data: json!([1, 2]) }],
        )
        .unwrap_err();
        assert!(matches!(err, DataError::Reconstruction { .. }));

        let err = reconstruct_large_data(
            "foo",
            &metadata,
            vec![
                ChunkRecord { chunk_index: 0, data: json!([1, 2]) },
                ChunkRecord { chunk_index: 2, data: json!([3]) },
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("chunk 1 missing"));
    }

    #[test]
    fn test_reconstruct_detects_checksum_mismatch() {
        let data = json!([1, 2, 3]);
        let metadata = metadata_for(&data, DataStructure::Array, 2, 3);
        let chunks = vec![
            ChunkRecord { chunk_index: 0, data: json!([1, 2]) },
            ChunkRecord { chunk_index: 1, data: json!([4]) },
        ];

        let err = reconstruct_large_data("foo", &metadata, chunks).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_metadata_wire_format() {
        let metadata = ChunkMetadata {
            total_chunks: 3,
            data_structure: DataStructure::Array,
            chunk_size: 1000,
            total_items: 2500,
            timestamp: 1_700_000_000_000,
            checksum: None,
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["totalChunks"], 3);
        assert_eq!(value["dataStructure"], "array");
        assert!(value.get("checksum").is_none());

        let legacy: ChunkMetadata =
            serde_json::from_value(json!({"totalChunks": 2, "dataStructure": "object"})).unwrap();
        assert_eq!(legacy.data_structure, DataStructure::Object);
        assert_eq!(legacy.checksum, None);
    }

    #[test]
    fn test_progress_percentage() {
        let info = ChunkInfo { chunk_index: 0, total_chunks: 4, processed_items: 250, total_items: 1000 };
        assert_eq!(info.progress(), 25);
    }
}
