use std::collections::HashMap;
use std::sync::Arc;

use event_store::{EventEnvelope, EventStore};
use futures_util::StreamExt;
use tokio::sync::RwLock;

use crate::error::{ProjectionError, Result};
use crate::projection::{ProjectionDefinition, ProjectionState, ProjectionStatus};

struct ProjectionSlot {
    definition: ProjectionDefinition,
    state: ProjectionState,
}

/// Holds every registered projection and folds events into them.
///
/// Events are applied at most once per projection, keyed on each
/// stream's version, so redeliveries and rebuild overlaps never
/// double-count while streams may interleave out of global sequence
/// order. Rebuilds replay the whole log from the store.
pub struct ProjectionEngine {
    store: Arc<dyn EventStore>,
    slots: RwLock<HashMap<String, ProjectionSlot>>,
}

impl ProjectionEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a projection, replacing any definition with the same
    /// id. State starts from the definition's initial value.
    pub async fn register(&self, definition: ProjectionDefinition) {
        let state = ProjectionState::initial(&definition);
        let id = definition.id.clone();
        let mut slots = self.slots.write().await;
        if slots
            .insert(id.clone(), ProjectionSlot { definition, state })
            .is_some()
        {
            tracing::info!(projection = %id, "projection definition replaced");
        }
    }

    /// Folds `event` into every active projection that consumes its
    /// type and is past its watermark. Returns the ids of projections
    /// that changed, for cache invalidation.
    pub async fn apply(&self, event: &EventEnvelope) -> Vec<String> {
        let mut updated = Vec::new();
        let mut slots = self.slots.write().await;
        for slot in slots.values_mut() {
            if slot.state.status != ProjectionStatus::Active {
                continue;
            }
            let Some(fold) = slot.definition.fold_for(&event.event_type) else {
                continue;
            };
            if !slot.state.accepts(event) {
                tracing::debug!(
                    projection = %slot.state.id,
                    aggregate_id = %event.aggregate_id,
                    version = event.version.as_i64(),
                    "stream version already applied, skipped"
                );
                continue;
            }
            fold(&mut slot.state.data, event);
            slot.state.record(event);
            metrics::counter!("projection_events_applied").increment(1);
            updated.push(slot.state.id.clone());
        }
        updated
    }

    /// Snapshot of one projection's state.
    pub async fn get(&self, id: &str) -> Option<ProjectionState> {
        self.slots.read().await.get(id).map(|slot| slot.state.clone())
    }

    /// Snapshots of every projection, sorted by id.
    pub async fn list(&self) -> Vec<ProjectionState> {
        let slots = self.slots.read().await;
        let mut states: Vec<ProjectionState> =
            slots.values().map(|slot| slot.state.clone()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub async fn count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Pauses a projection; applied events are skipped until resume.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.set_status(id, ProjectionStatus::Paused).await
    }

    /// Resumes a paused projection. Events published while paused are
    /// not replayed automatically; rebuild to catch up.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.set_status(id, ProjectionStatus::Active).await
    }

    async fn set_status(&self, id: &str, status: ProjectionStatus) -> Result<()> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| ProjectionError::NotFound(id.to_string()))?;
        slot.state.status = status;
        Ok(())
    }

    /// Rebuilds a projection from scratch by replaying the full event
    /// log in sequence order. The projection is locked for the
    /// duration; reads see the rebuilt state only once it completes.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, id: &str) -> Result<ProjectionState> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| ProjectionError::NotFound(id.to_string()))?;

        slot.state = ProjectionState::initial(&slot.definition);
        slot.state.status = ProjectionStatus::Rebuilding;

        let mut stream = self.store.stream_all_events().await?;
        let mut replayed = 0u64;
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    slot.state.status = ProjectionStatus::Failed;
                    return Err(err.into());
                }
            };
            if let Some(fold) = slot.definition.fold_for(&event.event_type) {
                fold(&mut slot.state.data, &event);
                slot.state.record(&event);
                replayed += 1;
            }
        }

        slot.state.status = ProjectionStatus::Active;
        tracing::info!(projection = %id, replayed, "projection rebuilt");
        metrics::counter!("projection_rebuilds").increment(1);
        Ok(slot.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::{AggregateId, AppendOptions, MemoryEventStore, NewEvent};
    use serde_json::json;

    fn user_list() -> ProjectionDefinition {
        ProjectionDefinition::new("user_list", "Users", "user")
            .with_initial(json!({"users": [], "total": 0}))
            .on("UserCreated", |data, event| {
                if let Some(users) = data["users"].as_array_mut() {
                    users.push(event.payload.clone());
                }
                data["total"] = json!(data["users"].as_array().map_or(0, Vec::len));
            })
            .on("UserDeleted", |data, event| {
                if let Some(users) = data["users"].as_array_mut() {
                    users.retain(|u| u["user_id"] != event.payload["user_id"]);
                }
                data["total"] = json!(data["users"].as_array().map_or(0, Vec::len));
            })
    }

    async fn append_user(store: &MemoryEventStore, name: &str) -> EventEnvelope {
        let agg = AggregateId::new();
        store
            .append(
                agg,
                "User",
                vec![NewEvent::new(
                    "UserCreated",
                    json!({"user_id": agg.to_string(), "name": name}),
                )],
                AppendOptions::new(),
            )
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn apply_folds_matching_events() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        let event = append_user(&store, "ada").await;
        let updated = engine.apply(&event).await;
        assert_eq!(updated, vec!["user_list".to_string()]);

        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.data["total"], json!(1));
        assert_eq!(state.data["users"][0]["name"], json!("ada"));
        assert_eq!(state.last_event_sequence, Some(event.sequence));
    }

    #[tokio::test]
    async fn replayed_event_is_applied_once() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        let event = append_user(&store, "ada").await;
        assert_eq!(engine.apply(&event).await.len(), 1);
        assert!(engine.apply(&event).await.is_empty());

        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.data["total"], json!(1));
    }

    #[tokio::test]
    async fn late_event_from_another_stream_still_applies() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        let first = append_user(&store, "ada").await;
        let second = append_user(&store, "grace").await;

        // The higher-sequence event reaches the engine first; the
        // earlier one from a different stream must not be dropped.
        assert_eq!(engine.apply(&second).await.len(), 1);
        assert_eq!(engine.apply(&first).await.len(), 1);

        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.data["total"], json!(2));
    }

    #[tokio::test]
    async fn incremental_fold_matches_rebuild() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        for name in ["ada", "grace", "barbara"] {
            let event = append_user(&store, name).await;
            engine.apply(&event).await;
        }
        let live = engine.get("user_list").await.unwrap();

        let rebuilt = engine.rebuild("user_list").await.unwrap();
        assert_eq!(rebuilt.data, live.data);
        assert_eq!(rebuilt.version, live.version);
    }

    #[tokio::test]
    async fn unmatched_event_types_are_ignored() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        let agg = AggregateId::new();
        let event = store
            .append(
                agg,
                "Order",
                vec![NewEvent::new("OrderPlaced", json!({}))],
                AppendOptions::new(),
            )
            .await
            .unwrap()
            .remove(0);

        assert!(engine.apply(&event).await.is_empty());
        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn paused_projection_skips_events() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;
        engine.pause("user_list").await.unwrap();

        let event = append_user(&store, "ada").await;
        assert!(engine.apply(&event).await.is_empty());

        engine.resume("user_list").await.unwrap();
        let later = append_user(&store, "grace").await;
        assert_eq!(engine.apply(&later).await.len(), 1);

        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.data["total"], json!(1));
    }

    #[tokio::test]
    async fn rebuild_replays_the_full_log() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store.clone());
        engine.register(user_list()).await;

        // Events appended before registration are only visible after
        // a rebuild.
        append_user(&store, "ada").await;
        append_user(&store, "grace").await;
        let live = append_user(&store, "barbara").await;
        engine.apply(&live).await;

        let state = engine.get("user_list").await.unwrap();
        assert_eq!(state.data["total"], json!(1));

        let rebuilt = engine.rebuild("user_list").await.unwrap();
        assert_eq!(rebuilt.status, ProjectionStatus::Active);
        assert_eq!(rebuilt.version, 3);
        assert_eq!(rebuilt.data["total"], json!(3));

        // The watermark survives the rebuild, so the live event is
        // not double-counted afterwards.
        assert!(engine.apply(&live).await.is_empty());
    }

    #[tokio::test]
    async fn rebuild_of_unknown_projection_errors() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store);
        let err = engine.rebuild("missing").await.unwrap_err();
        assert!(matches!(err, ProjectionError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let store = Arc::new(MemoryEventStore::new());
        let engine = ProjectionEngine::new(store);
        engine
            .register(ProjectionDefinition::new("b_orders", "Orders", "order"))
            .await;
        engine.register(user_list()).await;

        let states = engine.list().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].id, "b_orders");
        assert_eq!(states[1].id, "user_list");
    }
}
