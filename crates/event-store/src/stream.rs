use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventEnvelope, Snapshot, Version};

/// The state of one aggregate's event stream.
///
/// `version` always equals the version of the last appended event, or the
/// newest snapshot's version when all later events have been pruned. The
/// `events` list holds the retained (possibly pruned) tail of the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    /// The aggregate this stream belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate.
    pub aggregate_type: String,

    /// Current stream version.
    pub version: Version,

    /// Retained events, oldest first.
    pub events: Vec<EventEnvelope>,

    /// Retained snapshots, oldest first.
    pub snapshots: Vec<Snapshot>,

    /// When the stream was last appended to or snapshotted.
    pub last_modified: DateTime<Utc>,
}

impl StreamState {
    /// Returns the newest retained snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}
