/*!
Error types for the savestore core engine.
*/

use std::fmt;
use thiserror::Error;

/// Result type used throughout the savestore core.
pub type Result<T> = std::result::Result<T, DataError>;

/// Operation tag attached to errors surfaced from public operations.
///
/// Tags are stable identifiers that UI code can map to a remediation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationTag {
    Save,
    Load,
    Delete,
    LargeDataSave,
    LargeDataLoad,
    LargeDataReconstruction,
    LargeDataDelete,
    ImportValidation,
    ConflictResolution,
    ImportExecution,
    Export,
    Sync,
}

impl OperationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTag::Save => "SAVE_ERROR",
            OperationTag::Load => "LOAD_ERROR",
            OperationTag::Delete => "DELETE_ERROR",
            OperationTag::LargeDataSave => "LARGE_DATA_SAVE_ERROR",
            OperationTag::LargeDataLoad => "LARGE_DATA_LOAD_ERROR",
            OperationTag::LargeDataReconstruction => "LARGE_DATA_RECONSTRUCTION_ERROR",
            OperationTag::LargeDataDelete => "LARGE_DATA_DELETE_ERROR",
            OperationTag::ImportValidation => "IMPORT_VALIDATION_ERROR",
            OperationTag::ConflictResolution => "CONFLICT_RESOLUTION_ERROR",
            OperationTag::ImportExecution => "IMPORT_EXECUTION_ERROR",
            OperationTag::Export => "EXPORT_ERROR",
            OperationTag::Sync => "SYNC_ERROR",
        }
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during persistence and import operations.
#[derive(Error, Debug)]
pub enum DataError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Malformed, oversized or version-incompatible input. Never retried.
    #[error("Validation error: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    /// Unknown or unusable conflict resolution strategy
    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    /// A storage backend call was rejected
    #[error("Storage error during {operation} of '{key}': {message}")]
    Storage {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Chunk metadata missing, chunk count mismatch or checksum failure
    #[error("Reconstruction of '{data_type}' failed: {message}")]
    Reconstruction { data_type: String, message: String },

    /// Data type name rejected by the key rules
    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    /// The operation queue was closed before the operation started
    #[error("Operation queue is closed")]
    QueueClosed,

    /// An optional collaborator is not attached
    #[error("{0} not available")]
    NotAvailable(String),

    /// Error-kind wrapper carrying the failing operation and data type
    #[error("[{tag}] {data_type}: {source}")]
    Operation {
        tag: OperationTag,
        data_type: String,
        #[source]
        source: Box<DataError>,
    },
}

impl DataError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<K: Into<String>, S: Into<String>>(operation: &'static str, key: K, msg: S) -> Self {
        Self::Storage {
            operation,
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with a single message
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation {
            errors: vec![msg.into()],
        }
    }

    /// Create a reconstruction error
    pub fn reconstruction<D: Into<String>, S: Into<String>>(data_type: D, msg: S) -> Self {
        Self::Reconstruction {
            data_type: data_type.into(),
            message: msg.into(),
        }
    }

    /// Wrap this error with an operation tag. Already-tagged errors keep
    /// their innermost tag.
    pub fn tagged<D: Into<String>>(self, tag: OperationTag, data_type: D) -> Self {
        match self {
            err @ DataError::Operation { .. } => err,
            err => DataError::Operation {
                tag,
                data_type: data_type.into(),
                source: Box::new(err),
            },
        }
    }

    /// The operation tag, when the error carries one
    pub fn tag(&self) -> Option<OperationTag> {
        match self {
            DataError::Operation { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    /// The untagged error underneath any operation wrapper
    pub fn root(&self) -> &DataError {
        match self {
            DataError::Operation { source, .. } => source.root(),
            err => err,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root(), DataError::Validation { .. })
    }
}
