//! Boundary with a cloud sync collaborator
//!
//! Transport is out of scope for this crate. The engine only calls through
//! [`SyncCollaborator`] and reports the outcome as events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced_types: Vec<String>,
    pub conflicts: usize,
}

/// Collaborator-reported sync state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub connected: bool,
    pub in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SyncCollaborator: Send + Sync {
    /// Push local changes and pull remote ones
    async fn sync(&self) -> Result<SyncReport>;

    fn status(&self) -> SyncStatus;
}
