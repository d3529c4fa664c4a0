use std::collections::HashMap;
use std::sync::Arc;

use event_store::{
    AggregateId, AppendOptions, EventEnvelope, EventStore, NewEvent, Version,
};
use tokio::sync::Mutex;

use crate::error::HandlerError;
use crate::event::EventSink;

/// The write-side view of the event store handed to command handlers.
///
/// Appends go through the underlying store and the recorded events are
/// published to the event dispatcher in the same call, so handlers
/// never talk to the dispatcher directly. A per-stream lock spans the
/// append and the publication, so one stream's events always reach the
/// dispatcher in version order; different streams stay parallel.
#[derive(Clone)]
pub struct DispatchingStore {
    store: Arc<dyn EventStore>,
    sink: EventSink,
    streams: Arc<Mutex<HashMap<AggregateId, Arc<Mutex<()>>>>>,
}

impl DispatchingStore {
    pub fn new(store: Arc<dyn EventStore>, sink: EventSink) -> Self {
        Self {
            store,
            sink,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn stream_lock(&self, aggregate_id: AggregateId) -> Arc<Mutex<()>> {
        let mut streams = self.streams.lock().await;
        Arc::clone(streams.entry(aggregate_id).or_default())
    }

    /// Read access to the underlying store, e.g. for rehydrating
    /// aggregate state before deciding.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Appends `events` and announces the recorded envelopes.
    ///
    /// A concurrency conflict surfaces as
    /// [`HandlerError::Conflict`] so the dispatcher can map it to a
    /// typed result.
    pub async fn append_events(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<NewEvent>,
        expected_version: Option<Version>,
    ) -> Result<Vec<EventEnvelope>, HandlerError> {
        let options = match expected_version {
            Some(version) => AppendOptions::expect_version(version),
            None => AppendOptions::new(),
        };
        let lock = self.stream_lock(aggregate_id).await;
        let _ordered = lock.lock().await;
        let recorded = self
            .store
            .append(aggregate_id, aggregate_type, events, options)
            .await?;
        self.sink.publish_all(&recorded);
        Ok(recorded)
    }
}
