//! End-to-end flows through one wired engine: commands to events to
//! projections to queries, saga compensation, retry exhaustion, and
//! engine statistics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch::{
    CacheStatus, Command, CommandHandler, DispatchingStore, ErrorCode, EventHandler, HandlerError,
    Query, QueryHandler, QueryResponse, RetryPolicy,
};
use engine::{CqrsEngine, EngineConfig};
use event_store::{AggregateId, EventEnvelope, EventQuery, NewEvent};
use projections::{ProjectionDefinition, ProjectionEngine};
use saga::{SagaDefinition, SagaOrchestrator, SagaStatus, StepSpec};
use serde_json::json;

struct AppendOne {
    event_type: &'static str,
    fail: bool,
}

#[async_trait]
impl CommandHandler for AppendOne {
    async fn handle(
        &self,
        command: &Command,
        store: &DispatchingStore,
    ) -> Result<Vec<EventEnvelope>, HandlerError> {
        if self.fail {
            return Err(HandlerError::failed(format!("{} declined", command.command_type)));
        }
        let events = store
            .append_events(
                command.aggregate_id,
                &command.aggregate_type,
                vec![NewEvent::new(self.event_type, command.payload.clone())],
                command.metadata.expected_version,
            )
            .await?;
        Ok(events)
    }
}

struct ListUsers {
    projections: Arc<ProjectionEngine>,
}

#[async_trait]
impl QueryHandler for ListUsers {
    async fn handle(&self, _query: &Query) -> Result<QueryResponse, HandlerError> {
        let state = self
            .projections
            .get("user_list")
            .await
            .ok_or_else(|| HandlerError::failed("user_list projection missing"))?;
        Ok(QueryResponse::new(state.data)
            .with_projection_version(state.version)
            .with_last_modified(state.last_updated))
    }
}

fn user_list() -> ProjectionDefinition {
    ProjectionDefinition::new("user_list", "Users", "user")
        .with_initial(json!({"users": [], "total": 0}))
        .on("UserCreated", |data, event| {
            if let Some(users) = data["users"].as_array_mut() {
                users.push(event.payload.clone());
            }
            data["total"] = json!(data["users"].as_array().map_or(0, Vec::len));
        })
}

async fn wait_for_projection_version(engine: &CqrsEngine, id: &str, version: u64) {
    for _ in 0..200 {
        if let Some(state) = engine.projection(id).await
            && state.version >= version
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("projection {id} never reached version {version}");
}

#[tokio::test]
async fn command_to_projection_to_query_flow() {
    // A long TTL so a fresh post-write answer can only come from
    // invalidation, never from entry expiry.
    let config = EngineConfig {
        query_cache_ttl: Duration::from_secs(60),
        ..EngineConfig::default()
    };
    let engine = CqrsEngine::new(config);
    engine
        .register_command(
            "CreateUser",
            Arc::new(AppendOne {
                event_type: "UserCreated",
                fail: false,
            }),
        )
        .await;
    engine.register_projection(user_list()).await;
    engine
        .register_query(
            "ListUsers",
            Arc::new(ListUsers {
                projections: engine.projection_engine(),
            }),
        )
        .await;

    for name in ["ada", "grace"] {
        let result = engine
            .execute_command(Command::new(
                "CreateUser",
                AggregateId::new(),
                "User",
                json!({"name": name}),
            ))
            .await;
        assert!(result.success, "command failed: {:?}", result.error);
    }
    wait_for_projection_version(&engine, "user_list", 2).await;

    let first = engine.execute_query(Query::new("ListUsers", json!({}))).await;
    assert!(first.success);
    assert_eq!(first.cache_status, CacheStatus::Miss);
    assert_eq!(first.data.as_ref().unwrap()["total"], json!(2));
    assert_eq!(first.projection_version, Some(2));

    let second = engine.execute_query(Query::new("ListUsers", json!({}))).await;
    assert_eq!(second.cache_status, CacheStatus::Hit);
    assert_eq!(first.data, second.data);

    // A new write invalidates the cached answer through the
    // projection relay. The relay invalidates right after folding, so
    // poll the query until the fresh answer lands.
    engine
        .execute_command(Command::new(
            "CreateUser",
            AggregateId::new(),
            "User",
            json!({"name": "barbara"}),
        ))
        .await;
    wait_for_projection_version(&engine, "user_list", 3).await;

    let mut third = engine.execute_query(Query::new("ListUsers", json!({}))).await;
    for _ in 0..200 {
        if third.data.as_ref().is_some_and(|data| data["total"] == json!(3)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        third = engine.execute_query(Query::new("ListUsers", json!({}))).await;
    }
    assert_eq!(third.data.unwrap()["total"], json!(3));
    assert_eq!(third.projection_version, Some(3));

    engine.shutdown().await;
}

#[tokio::test]
async fn saga_failure_compensates_and_skips_later_steps() {
    let engine = CqrsEngine::new(EngineConfig::default());
    engine
        .register_command(
            "ReserveInventory",
            Arc::new(AppendOne {
                event_type: "InventoryReserved",
                fail: false,
            }),
        )
        .await;
    engine
        .register_command(
            "ChargePayment",
            Arc::new(AppendOne {
                event_type: "PaymentCharged",
                fail: true,
            }),
        )
        .await;
    engine
        .register_command(
            "ShipOrder",
            Arc::new(AppendOne {
                event_type: "OrderShipped",
                fail: false,
            }),
        )
        .await;
    engine
        .register_command(
            "ReleaseInventory",
            Arc::new(AppendOne {
                event_type: "InventoryReleased",
                fail: false,
            }),
        )
        .await;

    let order = AggregateId::new();
    let definition = SagaDefinition::new("order-fulfillment")
        .step(
            StepSpec::new(
                "reserve",
                Command::new("ReserveInventory", order, "Order", json!({"sku": "X"})),
            )
            .compensated_by(Command::new(
                "ReleaseInventory",
                order,
                "Order",
                json!({"sku": "X"}),
            )),
        )
        .step(StepSpec::new(
            "charge",
            Command::new("ChargePayment", order, "Order", json!({"amount": 10})),
        ))
        .step(StepSpec::new(
            "ship",
            Command::new("ShipOrder", order, "Order", json!({})),
        ));

    let run = engine.run_saga(definition).await.unwrap();
    assert_eq!(run.status, SagaStatus::Completed);
    assert!(!run.succeeded());
    assert_eq!(run.error.as_ref().unwrap().code, ErrorCode::HandlerError);
    assert_eq!(run.compensations.len(), 1);
    assert_eq!(run.compensations[0].step, "reserve");

    let fetched = engine.saga(run.id).await.unwrap();
    assert_eq!(fetched.status, SagaStatus::Completed);

    // The failed and skipped steps left no events behind.
    let store = engine.store();
    let recorded = store
        .query_events(EventQuery::for_aggregate(order))
        .await
        .unwrap();
    let types: Vec<&str> = recorded.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["InventoryReserved", "InventoryReleased"]);

    engine.shutdown().await;
}

struct StartFulfillment {
    sagas: Arc<SagaOrchestrator>,
}

#[async_trait]
impl EventHandler for StartFulfillment {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let definition = SagaDefinition::new("order-fulfillment").step(StepSpec::new(
            "reserve",
            Command::new(
                "ReserveInventory",
                event.aggregate_id,
                "Order",
                event.payload.clone(),
            ),
        ));
        self.sagas
            .run(definition)
            .await
            .map_err(|err| HandlerError::failed(err.to_string()))?;
        Ok(())
    }
}

#[tokio::test]
async fn event_handler_can_start_a_saga() {
    let engine = CqrsEngine::new(EngineConfig::default());
    engine
        .register_command(
            "PlaceOrder",
            Arc::new(AppendOne {
                event_type: "OrderPlaced",
                fail: false,
            }),
        )
        .await;
    engine
        .register_command(
            "ReserveInventory",
            Arc::new(AppendOne {
                event_type: "InventoryReserved",
                fail: false,
            }),
        )
        .await;
    engine
        .register_event_handler(
            "OrderPlaced",
            "start-fulfillment",
            Arc::new(StartFulfillment {
                sagas: engine.saga_orchestrator(),
            }),
        )
        .await;

    let order = AggregateId::new();
    let result = engine
        .execute_command(Command::new("PlaceOrder", order, "Order", json!({"sku": "X"})))
        .await;
    assert!(result.success);

    engine.shutdown().await;

    let runs = engine.saga_runs().await;
    assert_eq!(runs.len(), 1);
    assert!(runs[0].succeeded());

    let recorded = engine
        .store()
        .query_events(EventQuery::for_aggregate(order))
        .await
        .unwrap();
    let types: Vec<&str> = recorded.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["OrderPlaced", "InventoryReserved"]);
}

struct AlwaysFails;

#[async_trait]
impl EventHandler for AlwaysFails {
    async fn handle(&self, _event: &EventEnvelope) -> Result<(), HandlerError> {
        Err(HandlerError::failed("downstream unavailable"))
    }
}

#[tokio::test]
async fn exhausted_event_handler_dead_letters() {
    let engine = CqrsEngine::new(EngineConfig::default());
    engine
        .register_command(
            "CreateUser",
            Arc::new(AppendOne {
                event_type: "UserCreated",
                fail: false,
            }),
        )
        .await;
    engine
        .register_event_handler_with(
            "UserCreated",
            "notify",
            Arc::new(AlwaysFails),
            RetryPolicy::fixed(2, Duration::from_millis(5)),
            true,
        )
        .await;

    let result = engine
        .execute_command(Command::new(
            "CreateUser",
            AggregateId::new(),
            "User",
            json!({"name": "ada"}),
        ))
        .await;
    assert!(result.success);

    engine.shutdown().await;

    let letters = engine.dead_letters().entries().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].handler, "notify");
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].event.event_type, "UserCreated");
}

#[tokio::test]
async fn statistics_cover_store_projections_and_sagas() {
    let engine = CqrsEngine::new(EngineConfig::default());
    engine
        .register_command(
            "CreateUser",
            Arc::new(AppendOne {
                event_type: "UserCreated",
                fail: false,
            }),
        )
        .await;
    engine.register_projection(user_list()).await;

    for name in ["ada", "grace"] {
        engine
            .execute_command(Command::new(
                "CreateUser",
                AggregateId::new(),
                "User",
                json!({"name": name}),
            ))
            .await;
    }
    engine
        .register_command(
            "ReserveInventory",
            Arc::new(AppendOne {
                event_type: "InventoryReserved",
                fail: false,
            }),
        )
        .await;
    engine
        .run_saga(SagaDefinition::new("order-fulfillment").step(StepSpec::new(
            "reserve",
            Command::new("ReserveInventory", AggregateId::new(), "Order", json!({})),
        )))
        .await
        .unwrap();

    let stats = engine.statistics().await.unwrap();
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.total_streams, 3);
    assert_eq!(stats.total_projections, 1);
    assert_eq!(stats.total_sagas, 1);
    assert_eq!(stats.events_by_type["UserCreated"], 2);
    assert_eq!(stats.events_by_type["InventoryReserved"], 1);
    assert_eq!(stats.recent_events.len(), 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn rebuild_catches_up_a_late_projection() {
    let engine = CqrsEngine::new(EngineConfig::default());
    engine
        .register_command(
            "CreateUser",
            Arc::new(AppendOne {
                event_type: "UserCreated",
                fail: false,
            }),
        )
        .await;

    // Events recorded before the projection exists.
    for name in ["ada", "grace"] {
        engine
            .execute_command(Command::new(
                "CreateUser",
                AggregateId::new(),
                "User",
                json!({"name": name}),
            ))
            .await;
    }

    engine.register_projection(user_list()).await;
    let fresh = engine.projection("user_list").await.unwrap();
    assert_eq!(fresh.version, 0);

    let rebuilt = engine.rebuild_projection("user_list").await.unwrap();
    assert_eq!(rebuilt.version, 2);
    assert_eq!(rebuilt.data["total"], json!(2));

    engine.shutdown().await;
}
