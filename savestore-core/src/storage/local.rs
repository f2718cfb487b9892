/*!
Local directory storage backend.
*/

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value;
use tokio::fs;

use super::StorageBackend;
use crate::{DataError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How record values are encoded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordCodec {
    /// Plain JSON text
    #[default]
    Plain,
    /// Gzip-compressed JSON
    Gzip,
}

impl RecordCodec {
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        match self {
            RecordCodec::Plain => Ok(json),
            RecordCodec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&json)
                    .map_err(|e| DataError::compression(format!("Failed to compress record: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| DataError::compression(format!("Failed to finish compression: {e}")))
            }
        }
    }

    /// Decode either encoding; gzip is recognised by its magic bytes so a
    /// directory can hold a mix of both.
    pub fn decode(bytes: &[u8]) -> Result<Value> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(bytes);
            let mut json = Vec::new();
            decoder
                .read_to_end(&mut json)
                .map_err(|e| DataError::compression(format!("Failed to decompress record: {e}")))?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }
}

/// Local directory storage backend
///
/// Each key is stored as `<base_dir>/<key>.json`. The directory is created
/// on first write. Keys containing path separators are rejected.
///
/// # Example
/// ```rust,no_run
/// use savestore_core::storage::{LocalFileStorage, StorageBackend};
///
/// # async fn run() -> savestore_core::Result<()> {
/// let storage = LocalFileStorage::with_base_dir("/var/lib/bubblepop");
/// storage.save("bubblePop_settings", &serde_json::json!({"volume": 3})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    codec: RecordCodec,
}

impl LocalFileStorage {
    /// Create a backend rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            codec: RecordCodec::Plain,
        }
    }

    /// Choose the encoding used for new writes
    pub fn with_codec(mut self, codec: RecordCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve_path(&self, operation: &'static str, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(DataError::storage(operation, key, "key is not a valid file name"));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl StorageBackend for LocalFileStorage {
    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        let full_path = self.resolve_path("save", key)?;
        let bytes = self.codec.encode(value)?;

        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            DataError::storage(
                "save",
                key,
                format!("Failed to create directory {}: {e}", self.base_dir.display()),
            )
        })?;

        // Write to a sibling temp file first so readers never see a torn record
        let tmp_path = full_path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).await.map_err(|e| {
            DataError::storage("save", key, format!("Failed to write {}: {e}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, &full_path).await.map_err(|e| {
            DataError::storage("save", key, format!("Failed to commit {}: {e}", full_path.display()))
        })?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let full_path = self.resolve_path("load", key)?;

        match fs::read(&full_path).await {
            Ok(bytes) => RecordCodec::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DataError::storage(
                "load",
                key,
                format!("Failed to read {}: {e}", full_path.display()),
            )),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path("remove", key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DataError::storage(
                "remove",
                key,
                format!("Failed to delete {}: {e}", full_path.display()),
            )),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DataError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(".json") {
                if key.starts_with(prefix) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
