use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, NewEvent, Result, Sequence, Snapshot,
    SnapshotPolicy, StreamState, Version,
    snapshot::fold_payload,
    store::{AppendOptions, EventStore, EventStream, StoreStats},
};

const RECENT_EVENTS: usize = 10;

/// One aggregate's stream: version counter, retained events, snapshots.
/// Guarded by its own mutex so appends to different aggregates never
/// contend.
#[derive(Debug)]
struct StreamSlot {
    aggregate_type: String,
    version: Version,
    events: Vec<EventEnvelope>,
    snapshots: Vec<Snapshot>,
    last_modified: DateTime<Utc>,
}

impl StreamSlot {
    fn new(aggregate_type: &str) -> Self {
        Self {
            aggregate_type: aggregate_type.to_string(),
            version: Version::initial(),
            events: Vec::new(),
            snapshots: Vec::new(),
            last_modified: Utc::now(),
        }
    }
}

/// The global log owns the sequence counter so events enter it already in
/// sequence order.
#[derive(Debug, Default)]
struct GlobalLog {
    events: Vec<EventEnvelope>,
    next_sequence: u64,
}

/// In-memory event store: the reference implementation of [`EventStore`].
///
/// Appends to one aggregate are serialized on a per-stream mutex; appends
/// to different aggregates proceed in parallel. The global log keeps every
/// event in sequence order for audit and projection rebuild; snapshot
/// pruning trims only the per-stream retained copy.
#[derive(Clone)]
pub struct MemoryEventStore {
    streams: Arc<RwLock<HashMap<AggregateId, Arc<Mutex<StreamSlot>>>>>,
    log: Arc<RwLock<GlobalLog>>,
    policy: SnapshotPolicy,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    /// Creates an empty store with the default snapshot policy.
    pub fn new() -> Self {
        Self::with_policy(SnapshotPolicy::default())
    }

    /// Creates an empty store with the given snapshot policy.
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            log: Arc::new(RwLock::new(GlobalLog::default())),
            policy,
        }
    }

    /// Returns the total number of events committed to the store.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Clears all streams, snapshots, and the global log.
    pub async fn clear(&self) {
        self.streams.write().await.clear();
        let mut log = self.log.write().await;
        log.events.clear();
        log.next_sequence = 0;
    }

    async fn slot(&self, aggregate_id: AggregateId) -> Option<Arc<Mutex<StreamSlot>>> {
        self.streams.read().await.get(&aggregate_id).cloned()
    }

    async fn slot_or_create(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Arc<Mutex<StreamSlot>> {
        let mut streams = self.streams.write().await;
        streams
            .entry(aggregate_id)
            .or_insert_with(|| Arc::new(Mutex::new(StreamSlot::new(aggregate_type))))
            .clone()
    }

    /// Folds retained events after the newest snapshot into a new snapshot,
    /// trims old snapshots, and prunes events behind the retention window.
    /// Caller must hold the stream lock.
    fn snapshot_locked(&self, aggregate_id: AggregateId, slot: &mut StreamSlot) -> Snapshot {
        let mut state = slot
            .snapshots
            .last()
            .map(|s| s.state.clone())
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
        let folded_from = slot
            .snapshots
            .last()
            .map(|s| s.version)
            .unwrap_or_else(Version::initial);

        for event in slot.events.iter().filter(|e| e.version > folded_from) {
            fold_payload(&mut state, event);
        }

        let snapshot = Snapshot::new(aggregate_id, &slot.aggregate_type, slot.version, state);
        slot.snapshots.push(snapshot.clone());
        if slot.snapshots.len() > self.policy.max_retained {
            let excess = slot.snapshots.len() - self.policy.max_retained;
            slot.snapshots.drain(..excess);
        }

        let cutoff = Version::new(snapshot.version.as_i64() - self.policy.retention_window);
        slot.events.retain(|e| e.version > cutoff);
        slot.last_modified = Utc::now();

        tracing::debug!(
            %aggregate_id,
            version = %snapshot.version,
            retained_events = slot.events.len(),
            "stream snapshotted"
        );

        snapshot
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<NewEvent>,
        options: AppendOptions,
    ) -> Result<Vec<EventEnvelope>> {
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend);
        }

        let slot = self.slot_or_create(aggregate_id, aggregate_type).await;
        let mut slot = slot.lock().await;

        if let Some(expected) = options.expected_version
            && slot.version != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: slot.version,
            });
        }

        // Assign versions and sequences and publish to the global log as
        // one unit, so the log stays sequence-ordered.
        let mut envelopes = Vec::with_capacity(events.len());
        {
            let mut log = self.log.write().await;
            let mut version = slot.version;
            for event in events {
                version = version.next();
                log.next_sequence += 1;
                let envelope = EventEnvelope::record(
                    event,
                    aggregate_id,
                    aggregate_type,
                    version,
                    Sequence::new(log.next_sequence),
                );
                log.events.push(envelope.clone());
                envelopes.push(envelope);
            }
        }

        slot.events.extend(envelopes.iter().cloned());
        slot.version = envelopes
            .last()
            .map(|e| e.version)
            .unwrap_or(slot.version);
        slot.last_modified = Utc::now();

        if slot.events.len() >= self.policy.threshold {
            self.snapshot_locked(aggregate_id, &mut slot);
        }

        Ok(envelopes)
    }

    async fn events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
        to_version: Option<Version>,
    ) -> Result<Vec<EventEnvelope>> {
        let Some(slot) = self.slot(aggregate_id).await else {
            return Ok(Vec::new());
        };
        let slot = slot.lock().await;
        Ok(slot
            .events
            .iter()
            .filter(|e| {
                from_version.is_none_or(|from| e.version >= from)
                    && to_version.is_none_or(|to| e.version <= to)
            })
            .cloned()
            .collect())
    }

    async fn get_stream(&self, aggregate_id: AggregateId) -> Result<Option<StreamState>> {
        let Some(slot) = self.slot(aggregate_id).await else {
            return Ok(None);
        };
        let slot = slot.lock().await;
        Ok(Some(StreamState {
            aggregate_id,
            aggregate_type: slot.aggregate_type.clone(),
            version: slot.version,
            events: slot.events.clone(),
            snapshots: slot.snapshots.clone(),
            last_modified: slot.last_modified,
        }))
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(log
            .events
            .iter()
            .filter(|e| query.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.log.read().await.events.clone();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let Some(slot) = self.slot(aggregate_id).await else {
            return Ok(None);
        };
        let slot = slot.lock().await;
        Ok(Some(slot.version))
    }

    async fn create_snapshot(&self, aggregate_id: AggregateId) -> Result<Snapshot> {
        let slot = self
            .slot(aggregate_id)
            .await
            .ok_or(EventStoreError::StreamNotFound(aggregate_id))?;
        let mut slot = slot.lock().await;
        Ok(self.snapshot_locked(aggregate_id, &mut slot))
    }

    async fn snapshots(&self, aggregate_id: AggregateId) -> Result<Vec<Snapshot>> {
        let Some(slot) = self.slot(aggregate_id).await else {
            return Ok(Vec::new());
        };
        let slot = slot.lock().await;
        Ok(slot.snapshots.clone())
    }

    async fn store_stats(&self) -> Result<StoreStats> {
        let log = self.log.read().await;
        let mut events_by_type: HashMap<String, u64> = HashMap::new();
        for event in &log.events {
            *events_by_type.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        let recent_events = log
            .events
            .iter()
            .rev()
            .take(RECENT_EVENTS)
            .rev()
            .cloned()
            .collect();
        let total_streams = self.streams.read().await.len() as u64;

        Ok(StoreStats {
            total_events: log.events.len() as u64,
            total_streams,
            events_by_type,
            recent_events,
        })
    }
}
