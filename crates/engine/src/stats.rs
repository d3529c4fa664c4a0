use std::collections::HashMap;

use event_store::EventEnvelope;
use serde::Serialize;

/// Point-in-time view of the whole engine, for dashboards and
/// debugging.
#[derive(Debug, Clone, Serialize)]
pub struct EventStatistics {
    pub total_events: u64,
    pub total_streams: u64,
    pub total_projections: u64,
    pub total_sagas: u64,
    pub events_by_type: HashMap<String, u64>,
    /// The most recent events in the global log, in sequence order
    /// (oldest of the window first).
    pub recent_events: Vec<EventEnvelope>,
}
