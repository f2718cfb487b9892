//! Save bundle export
//!
//! Bundles carry a header, the exported records under `userData`, and a
//! metadata block whose checksum the importer verifies.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk;
use crate::config::SAVE_FORMAT;
use crate::manager::{DataManager, LoadOptions};
use crate::{DataError, OperationTag, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleHeader {
    pub format: String,
    pub game_version: String,
    pub exported_at: String,
    pub export_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    /// SHA-256 of the serialized `userData`
    pub checksum: String,
    pub data_types: Vec<String>,
    /// Serialized `userData` size in bytes
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBundle {
    pub header: BundleHeader,
    pub user_data: Map<String, Value>,
    pub metadata: BundleMetadata,
}

impl SaveBundle {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub struct ExportManager {
    manager: Arc<DataManager>,
}

impl ExportManager {
    pub fn new(manager: Arc<DataManager>) -> Self {
        Self { manager }
    }

    /// Export `data_types`, or every registered type when empty. Types with
    /// no stored record are left out.
    pub async fn export_data(&self, data_types: &[String]) -> Result<SaveBundle> {
        self.build_bundle(data_types)
            .await
            .map_err(|e| e.tagged(OperationTag::Export, data_types.join(",")))
    }

    async fn build_bundle(&self, data_types: &[String]) -> Result<SaveBundle> {
        let requested = if data_types.is_empty() {
            self.manager.registry().data_types()
        } else {
            data_types.to_vec()
        };

        let mut user_data = Map::new();
        for data_type in &requested {
            match self.manager.load(data_type, LoadOptions::uncached()).await? {
                Value::Null => debug!(data_type = %data_type, "nothing stored, not exported"),
                value => {
                    user_data.insert(data_type.clone(), value);
                }
            }
        }
        if user_data.is_empty() {
            return Err(DataError::validation("no stored data to export"));
        }

        let payload = Value::Object(user_data);
        let checksum = chunk::checksum(&payload)?;
        let size = serde_json::to_vec(&payload)?.len();
        let Value::Object(user_data) = payload else {
            return Err(DataError::validation("userData must be an object"));
        };

        let bundle = SaveBundle {
            header: BundleHeader {
                format: SAVE_FORMAT.to_string(),
                game_version: self.manager.config().game_version.clone(),
                exported_at: Utc::now().to_rfc3339(),
                export_id: Uuid::new_v4().to_string(),
            },
            metadata: BundleMetadata {
                checksum,
                data_types: user_data.keys().cloned().collect(),
                size,
            },
            user_data,
        };
        info!(
            export_id = %bundle.header.export_id,
            data_types = bundle.metadata.data_types.len(),
            size,
            "export built"
        );
        Ok(bundle)
    }
}
