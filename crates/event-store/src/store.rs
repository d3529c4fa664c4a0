use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{
    AggregateId, EventEnvelope, EventQuery, NewEvent, Result, Snapshot, StreamState, Version,
};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected version of the aggregate for optimistic concurrency control.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the aggregate to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the aggregate to not exist (new aggregate).
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// A stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Aggregate counts for the observability surface.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Total number of events across all streams.
    pub total_events: u64,

    /// Number of aggregate streams.
    pub total_streams: u64,

    /// Event counts keyed by event type.
    pub events_by_type: HashMap<String, u64>,

    /// The most recently committed events, newest last.
    pub recent_events: Vec<EventEnvelope>,
}

/// Core trait for event store implementations.
///
/// An event store persists an ordered, append-only log per aggregate.
/// The store assigns stream versions and the global sequence at append
/// time. All implementations must be thread-safe (Send + Sync), and must
/// serialize appends per aggregate while allowing different aggregates to
/// proceed in parallel.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to one aggregate's stream.
    ///
    /// Each event is assigned the stream's next version and the next global
    /// sequence. The batch is atomic: either all events are appended or
    /// none are. If `options.expected_version` is set, the operation fails
    /// with `ConcurrencyConflict` when the stream's current version does
    /// not match; callers must reload and retry.
    ///
    /// Returns the fully populated envelopes in append order.
    async fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves retained events for an aggregate within an optional
    /// version range (inclusive), oldest first.
    async fn events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
        to_version: Option<Version>,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves the state of an aggregate's stream, or None if the
    /// aggregate has never been appended to.
    async fn get_stream(&self, aggregate_id: AggregateId) -> Result<Option<StreamState>>;

    /// Retrieves events matching a query, in global sequence order.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Streams every event in the store in ascending global sequence order.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Gets the current version of an aggregate.
    ///
    /// Returns None if the aggregate doesn't exist.
    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Folds the stream's retained events into a new snapshot at the
    /// current version, then prunes events outside the retention window.
    ///
    /// Fails with `StreamNotFound` if the aggregate has no stream. Also
    /// triggered automatically by `append` once the retained stream length
    /// reaches the configured threshold.
    async fn create_snapshot(&self, aggregate_id: AggregateId) -> Result<Snapshot>;

    /// Retrieves the retained snapshots for an aggregate, oldest first.
    /// Returns an empty list for unknown aggregates.
    async fn snapshots(&self, aggregate_id: AggregateId) -> Result<Vec<Snapshot>>;

    /// Returns aggregate counts over the whole store.
    async fn store_stats(&self) -> Result<StoreStats>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.aggregate_version(aggregate_id).await?.is_some())
    }

    /// Returns the newest snapshot for an aggregate, if any.
    async fn latest_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots(aggregate_id).await?.pop())
    }

    /// Loads an aggregate's snapshot (if any) and the events after it.
    ///
    /// If no snapshot exists, returns None and all retained events.
    async fn load_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.latest_snapshot(aggregate_id).await? {
            let events = self
                .events_for_aggregate(aggregate_id, Some(snapshot.version.next()), None)
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.events_for_aggregate(aggregate_id, None, None).await?;
            Ok((None, events))
        }
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}
