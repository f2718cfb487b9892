//! Engine events broadcast to UI collaborators

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast ring; slow subscribers miss older events
const EVENT_CAPACITY: usize = 256;

/// Large-data operation a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LargeDataOperation {
    Save,
    Load,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DataEvent {
    Initialized {
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    DataSaved {
        data_type: String,
        size: usize,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    DataLoaded {
        data_type: String,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    LargeDataProgress {
        operation: LargeDataOperation,
        data_type: String,
        progress: u8,
        processed_items: usize,
        total_items: usize,
    },
    #[serde(rename_all = "camelCase")]
    LargeDataDeleted {
        data_type: String,
        chunks: usize,
    },
    #[serde(rename_all = "camelCase")]
    ImportCompleted {
        success: bool,
        partial: bool,
        data_types: Vec<String>,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    CloudSyncCompleted {
        synced_types: Vec<String>,
    },
    CloudSyncFailed {
        error: String,
    },
}

impl DataEvent {
    /// Event name as exposed to listeners
    pub fn name(&self) -> &'static str {
        match self {
            DataEvent::Initialized { .. } => "initialized",
            DataEvent::DataSaved { .. } => "dataSaved",
            DataEvent::DataLoaded { .. } => "dataLoaded",
            DataEvent::LargeDataProgress { .. } => "largeDataProgress",
            DataEvent::LargeDataDeleted { .. } => "largeDataDeleted",
            DataEvent::ImportCompleted { .. } => "importCompleted",
            DataEvent::CloudSyncCompleted { .. } => "cloudSyncCompleted",
            DataEvent::CloudSyncFailed { .. } => "cloudSyncFailed",
        }
    }
}

/// Fan-out channel for [`DataEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DataEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: DataEvent) {
        let name = event.name();
        let receivers = self.sender.send(event).unwrap_or(0);
        trace!(event = name, receivers, "event emitted");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(DataEvent::LargeDataDeleted {
            data_type: "foo".to_string(),
            chunks: 3,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "largeDataDeleted");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "largeDataDeleted", "dataType": "foo", "chunks": 3})
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(DataEvent::Initialized { timestamp: 0 });
    }
}
