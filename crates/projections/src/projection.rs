use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use event_store::{AggregateId, EventEnvelope, EventId, Sequence, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pure fold applied to a projection's data for one event.
pub type FoldFn = Arc<dyn Fn(&mut Value, &EventEnvelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionStatus {
    Active,
    Rebuilding,
    Paused,
    Failed,
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectionStatus::Active => "Active",
            ProjectionStatus::Rebuilding => "Rebuilding",
            ProjectionStatus::Paused => "Paused",
            ProjectionStatus::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Declares a projection: an id, the event types it consumes, a
/// starting value, and one fold per event type.
///
/// ```
/// use projections::ProjectionDefinition;
///
/// let definition = ProjectionDefinition::new("user_list", "Users", "user")
///     .with_initial(serde_json::json!({"users": []}))
///     .on("UserCreated", |data, event| {
///         if let Some(users) = data["users"].as_array_mut() {
///             users.push(event.payload.clone());
///         }
///     });
/// assert_eq!(definition.event_types(), vec!["UserCreated"]);
/// ```
#[derive(Clone)]
pub struct ProjectionDefinition {
    pub id: String,
    pub name: String,
    /// Groups related projections, e.g. for shared cache invalidation.
    pub kind: String,
    pub initial: Value,
    folds: HashMap<String, FoldFn>,
}

impl ProjectionDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            initial: Value::Object(serde_json::Map::new()),
            folds: HashMap::new(),
        }
    }

    pub fn with_initial(mut self, initial: Value) -> Self {
        self.initial = initial;
        self
    }

    /// Registers the fold for `event_type`. One fold per type; a
    /// second call for the same type replaces the first.
    pub fn on(
        mut self,
        event_type: impl Into<String>,
        fold: impl Fn(&mut Value, &EventEnvelope) + Send + Sync + 'static,
    ) -> Self {
        self.folds.insert(event_type.into(), Arc::new(fold));
        self
    }

    pub fn fold_for(&self, event_type: &str) -> Option<&FoldFn> {
        self.folds.get(event_type)
    }

    /// The event types this projection consumes, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.folds.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Materialized state of one projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionState {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: ProjectionStatus,

    /// Count of events folded in, bumped on every applied event.
    pub version: u64,

    pub data: Value,

    /// Highest version applied per stream. Delivery is ordered within
    /// a stream but can interleave across streams out of global
    /// sequence order, so at-most-once application is tracked per
    /// stream: an event at or below its stream's entry is a
    /// redelivery and is skipped.
    pub stream_versions: HashMap<AggregateId, Version>,

    pub last_event_id: Option<EventId>,

    /// Highest global sequence applied, for observability.
    pub last_event_sequence: Option<Sequence>,

    pub last_updated: DateTime<Utc>,

    /// The event types this projection consumes, sorted.
    pub event_types: Vec<String>,
}

impl ProjectionState {
    pub fn initial(definition: &ProjectionDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            kind: definition.kind.clone(),
            status: ProjectionStatus::Active,
            version: 0,
            data: definition.initial.clone(),
            stream_versions: HashMap::new(),
            last_event_id: None,
            last_event_sequence: None,
            last_updated: Utc::now(),
            event_types: definition
                .event_types()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Whether `event` is new for its stream, i.e. past that stream's
    /// applied version.
    pub fn accepts(&self, event: &EventEnvelope) -> bool {
        self.stream_versions
            .get(&event.aggregate_id)
            .is_none_or(|applied| event.version > *applied)
    }

    pub(crate) fn record(&mut self, event: &EventEnvelope) {
        self.version += 1;
        self.stream_versions.insert(event.aggregate_id, event.version);
        self.last_event_id = Some(event.event_id);
        self.last_event_sequence = Some(match self.last_event_sequence {
            Some(seen) => seen.max(event.sequence),
            None => event.sequence,
        });
        self.last_updated = Utc::now();
    }
}
