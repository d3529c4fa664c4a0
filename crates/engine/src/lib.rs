//! Composition root for the CQRS engine.
//!
//! [`CqrsEngine`] wires one in-memory event store to the command,
//! query, and event dispatchers, the projection engine, and the saga
//! orchestrator. Events appended by command handlers flow through the
//! event dispatcher to registered handlers; projections ride the same
//! pipeline and invalidate the query cache as they change.

pub mod config;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch::{
    Command, CommandDispatcher, CommandHandler, CommandPredicate, CommandResult, DeadLetterQueue,
    EventDispatcher, EventHandler, HandlerError, Query, QueryDispatcher, QueryHandler, QueryResult,
    RetryPolicy,
};
use dispatch::query::CachePolicy;
use dispatch::store::DispatchingStore;
use event_store::{EventEnvelope, EventStore, MemoryEventStore};
use projections::{ProjectionDefinition, ProjectionEngine, ProjectionState};
use saga::{Saga, SagaDefinition, SagaId, SagaOrchestrator};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use config::EngineConfig;
pub use stats::EventStatistics;

/// Initializes tracing with the given default filter, honoring
/// `RUST_LOG` when set. Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Applies events to projections, invalidates the affected query
/// cache entries, then forwards to the user's handler when one is
/// registered for the type. Projection application is idempotent per
/// stream, so dispatcher retries of the inner handler are safe.
struct ProjectionRelay {
    projections: Arc<ProjectionEngine>,
    queries: Arc<QueryDispatcher>,
    inner: Option<Arc<dyn EventHandler>>,
}

#[async_trait]
impl EventHandler for ProjectionRelay {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        for projection_id in self.projections.apply(event).await {
            self.queries.invalidate(&projection_id).await;
        }
        match &self.inner {
            Some(inner) => inner.handle(event).await,
            None => Ok(()),
        }
    }
}

/// One fully wired engine instance: event store, dispatchers,
/// projections, and sagas sharing a single event pipeline.
///
/// Construct one per process (or per test); there is no global
/// instance.
pub struct CqrsEngine {
    config: EngineConfig,
    store: Arc<MemoryEventStore>,
    events: Arc<EventDispatcher>,
    commands: Arc<CommandDispatcher>,
    queries: Arc<QueryDispatcher>,
    projections: Arc<ProjectionEngine>,
    sagas: Arc<SagaOrchestrator>,
    /// User handlers by event type, so projection relays can wrap
    /// them and re-wrap on re-registration.
    user_handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl CqrsEngine {
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryEventStore::with_policy(config.snapshot_policy()));
        let events = Arc::new(EventDispatcher::new());
        let dispatching =
            DispatchingStore::new(Arc::clone(&store) as Arc<dyn EventStore>, events.sink());
        let commands = Arc::new(CommandDispatcher::new(
            dispatching,
            config.max_concurrent_commands,
            config.command_timeout,
        ));
        let queries = Arc::new(QueryDispatcher::new(config.query_cache_ttl));
        let projections = Arc::new(ProjectionEngine::new(
            Arc::clone(&store) as Arc<dyn EventStore>
        ));
        let sagas = Arc::new(SagaOrchestrator::new(Arc::clone(&commands)));

        tracing::info!(
            snapshot_threshold = config.snapshot_threshold,
            max_concurrent_commands = config.max_concurrent_commands,
            query_cache_ttl_ms = config.query_cache_ttl.as_millis() as u64,
            "engine initialized"
        );

        Self {
            config,
            store,
            events,
            commands,
            queries,
            projections,
            sagas,
            user_handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying event store, for direct reads.
    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store) as Arc<dyn EventStore>
    }

    /// The projection engine, e.g. for query handlers that read
    /// projection state.
    pub fn projection_engine(&self) -> Arc<ProjectionEngine> {
        Arc::clone(&self.projections)
    }

    /// The saga orchestrator, e.g. for event handlers that start
    /// sagas in reaction to recorded events.
    pub fn saga_orchestrator(&self) -> Arc<SagaOrchestrator> {
        Arc::clone(&self.sagas)
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        self.events.dead_letters()
    }

    /// Appends events directly, outside any command, and fans them out
    /// through the event pipeline like any other append.
    pub async fn append_events(
        &self,
        aggregate_id: event_store::AggregateId,
        aggregate_type: &str,
        events: Vec<event_store::NewEvent>,
        expected_version: Option<event_store::Version>,
    ) -> Result<Vec<EventEnvelope>, HandlerError> {
        self.commands
            .store()
            .append_events(aggregate_id, aggregate_type, events, expected_version)
            .await
    }

    // -- commands ---------------------------------------------------

    pub async fn register_command(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.commands.register(command_type, handler).await;
    }

    pub async fn register_command_with(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        validate: Option<CommandPredicate>,
        authorize: Option<CommandPredicate>,
    ) {
        self.commands
            .register_with(command_type, handler, validate, authorize)
            .await;
    }

    /// Executes a command; the outcome is always a typed result.
    pub async fn execute_command(&self, command: Command) -> CommandResult {
        self.commands.execute(command).await
    }

    // -- queries ----------------------------------------------------

    pub async fn register_query(
        &self,
        query_type: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) {
        self.queries.register(query_type, handler).await;
    }

    pub async fn register_query_with(
        &self,
        query_type: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
        cache: Option<CachePolicy>,
    ) {
        self.queries.register_with(query_type, handler, cache).await;
    }

    pub async fn execute_query(&self, query: Query) -> QueryResult {
        self.queries.execute(query).await
    }

    // -- events -----------------------------------------------------

    /// Registers an event handler with the default retry policy.
    pub async fn register_event_handler(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.register_event_handler_with(event_type, name, handler, RetryPolicy::default(), true)
            .await;
    }

    /// Registers an event handler, wrapped so projections consuming
    /// the same event type keep receiving it.
    pub async fn register_event_handler_with(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        retry: RetryPolicy,
        dead_letter: bool,
    ) {
        let event_type = event_type.into();
        self.user_handlers
            .write()
            .await
            .insert(event_type.clone(), Arc::clone(&handler));
        let relay = Arc::new(ProjectionRelay {
            projections: Arc::clone(&self.projections),
            queries: Arc::clone(&self.queries),
            inner: Some(handler),
        });
        self.events
            .register_with(event_type, name, relay, retry, dead_letter)
            .await;
    }

    // -- projections ------------------------------------------------

    /// Registers a projection and subscribes it to every event type
    /// it consumes. A user handler already registered for one of
    /// those types keeps running after the projection applies.
    pub async fn register_projection(&self, definition: ProjectionDefinition) {
        let event_types: Vec<String> = definition
            .event_types()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let projection_id = definition.id.clone();
        self.projections.register(definition).await;

        let user_handlers = self.user_handlers.read().await;
        for event_type in event_types {
            let relay = Arc::new(ProjectionRelay {
                projections: Arc::clone(&self.projections),
                queries: Arc::clone(&self.queries),
                inner: user_handlers.get(&event_type).cloned(),
            });
            self.events
                .register_with(
                    event_type.clone(),
                    format!("projection:{projection_id}"),
                    relay,
                    RetryPolicy::default(),
                    true,
                )
                .await;
        }
    }

    pub async fn projection(&self, id: &str) -> Option<ProjectionState> {
        self.projections.get(id).await
    }

    pub async fn projection_states(&self) -> Vec<ProjectionState> {
        self.projections.list().await
    }

    /// Rebuilds a projection from the full event log and clears any
    /// query cache entries that read from it.
    pub async fn rebuild_projection(&self, id: &str) -> projections::Result<ProjectionState> {
        let state = self.projections.rebuild(id).await?;
        self.queries.invalidate(id).await;
        Ok(state)
    }

    // -- sagas ------------------------------------------------------

    /// Runs a saga to completion through the command dispatcher.
    pub async fn run_saga(&self, definition: SagaDefinition) -> saga::Result<Saga> {
        self.sagas.run(definition).await
    }

    pub async fn saga(&self, id: SagaId) -> saga::Result<Saga> {
        self.sagas.get(id).await
    }

    pub async fn saga_runs(&self) -> Vec<Saga> {
        self.sagas.list().await
    }

    // -- observability ----------------------------------------------

    /// Aggregated statistics over the store, projections, and sagas.
    pub async fn statistics(&self) -> event_store::Result<EventStatistics> {
        let stats = self.store.store_stats().await?;
        Ok(EventStatistics {
            total_events: stats.total_events,
            total_streams: stats.total_streams,
            total_projections: self.projections.count().await as u64,
            total_sagas: self.sagas.count().await as u64,
            events_by_type: stats.events_by_type,
            recent_events: stats.recent_events,
        })
    }

    /// Waits for every event published so far to be handled, then
    /// stops the dispatch pipeline. The engine's stores and registries
    /// stay readable afterwards.
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
    }
}
