use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventEnvelope, Version};

/// A snapshot of an aggregate stream's folded state at a specific version.
///
/// Snapshots bound replay cost: loading an aggregate starts from the latest
/// snapshot and replays only the events recorded after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate this snapshot belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "User", "Order").
    pub aggregate_type: String,

    /// The stream version at the time of the snapshot.
    pub version: Version,

    /// When the snapshot was created.
    pub timestamp: DateTime<Utc>,

    /// The folded aggregate state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Gets a reference to the state as JSON.
    pub fn state_ref(&self) -> &serde_json::Value {
        &self.state
    }
}

/// Controls when streams are snapshotted and how aggressively old events
/// and snapshots are pruned.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Number of retained (uncompacted) events that triggers a snapshot.
    pub threshold: usize,

    /// Maximum number of recent snapshots retained per stream.
    pub max_retained: usize,

    /// Events within this many versions behind the newest snapshot are kept;
    /// anything older is pruned from the stream's retained copy.
    pub retention_window: i64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            threshold: 100,
            max_retained: 5,
            retention_window: 10,
        }
    }
}

/// Folds one event payload into an accumulated state value.
///
/// The engine is domain-agnostic, so the fold is a shallow merge: object
/// payload keys overwrite state keys. Chaining folds from the previous
/// snapshot therefore equals a full replay from version 0.
pub fn fold_payload(state: &mut serde_json::Value, event: &EventEnvelope) {
    if !state.is_object() {
        *state = serde_json::Value::Object(serde_json::Map::new());
    }
    if let (Some(target), Some(source)) = (state.as_object_mut(), event.payload.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}
