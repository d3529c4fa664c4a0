use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use event_store::EventEnvelope;
use tokio::sync::{RwLock, Semaphore};

use crate::error::{ErrorCode, HandlerError};
use crate::message::{Command, CommandResult};
use crate::store::DispatchingStore;

/// Decides a command against current aggregate state and returns the
/// events to record. Handlers append via the provided store so the
/// optimistic version check and event publication happen in one place.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &Command,
        store: &DispatchingStore,
    ) -> Result<Vec<EventEnvelope>, HandlerError>;
}

/// Pre-execution predicate over the command payload.
pub type CommandPredicate = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

struct CommandRegistration {
    handler: Arc<dyn CommandHandler>,
    validate: Option<CommandPredicate>,
    authorize: Option<CommandPredicate>,
    enabled: bool,
}

/// Routes commands to registered handlers and turns every outcome,
/// including handler failure and timeout, into a [`CommandResult`].
///
/// Execution is bounded by a semaphore so a burst of commands cannot
/// exhaust the runtime, and each command runs under a deadline.
pub struct CommandDispatcher {
    registrations: RwLock<HashMap<String, CommandRegistration>>,
    store: DispatchingStore,
    limiter: Arc<Semaphore>,
    default_deadline: Duration,
}

impl CommandDispatcher {
    pub fn new(store: DispatchingStore, max_concurrent: usize, default_deadline: Duration) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            store,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            default_deadline,
        }
    }

    pub fn store(&self) -> &DispatchingStore {
        &self.store
    }

    /// Registers `handler` for `command_type` with no validation or
    /// authorization predicates.
    pub async fn register(&self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.register_with(command_type, handler, None, None).await;
    }

    /// Registers `handler` with optional validation and authorization
    /// predicates, replacing any existing registration.
    pub async fn register_with(
        &self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        validate: Option<CommandPredicate>,
        authorize: Option<CommandPredicate>,
    ) {
        let command_type = command_type.into();
        let mut registrations = self.registrations.write().await;
        if registrations
            .insert(
                command_type.clone(),
                CommandRegistration {
                    handler,
                    validate,
                    authorize,
                    enabled: true,
                },
            )
            .is_some()
        {
            tracing::info!(command_type = %command_type, "command handler replaced");
        }
    }

    /// Toggles the handler for `command_type`. Returns false when no
    /// handler is registered.
    pub async fn set_enabled(&self, command_type: &str, enabled: bool) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations.get_mut(command_type) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Executes `command` through the full pipeline: lookup, enabled
    /// check, validation, authorization, then the handler under the
    /// concurrency limit and deadline.
    #[tracing::instrument(
        skip(self, command),
        fields(command_type = %command.command_type, aggregate_id = %command.aggregate_id)
    )]
    pub async fn execute(&self, command: Command) -> CommandResult {
        let started = Instant::now();

        let registration = {
            let registrations = self.registrations.read().await;
            registrations.get(&command.command_type).map(|r| {
                (
                    Arc::clone(&r.handler),
                    r.validate.clone(),
                    r.authorize.clone(),
                    r.enabled,
                )
            })
        };

        let Some((handler, validate, authorize, enabled)) = registration else {
            return self.reject(
                &command,
                ErrorCode::NotFound,
                format!("no handler registered for '{}'", command.command_type),
            );
        };
        if !enabled {
            return self.reject(
                &command,
                ErrorCode::Disabled,
                format!("handler for '{}' is disabled", command.command_type),
            );
        }
        if let Some(validate) = validate
            && !validate(&command)
        {
            return self.reject(&command, ErrorCode::ValidationFailed, "validation failed");
        }
        if let Some(authorize) = authorize
            && !authorize(&command)
        {
            return self.reject(
                &command,
                ErrorCode::AuthorizationFailed,
                "authorization failed",
            );
        }

        // The semaphore is never closed, so acquire cannot fail.
        let Ok(_permit) = self.limiter.acquire().await else {
            return self.reject(&command, ErrorCode::HandlerError, "dispatcher shut down");
        };

        let deadline = command.metadata.deadline.unwrap_or(self.default_deadline);
        let outcome = tokio::time::timeout(deadline, handler.handle(&command, &self.store)).await;

        let result = match outcome {
            Err(_) => self.reject(
                &command,
                ErrorCode::Timeout,
                format!(
                    "deadline of {}ms elapsed; outcome unknown",
                    deadline.as_millis()
                ),
            ),
            Ok(Err(err)) => self.reject(&command, err.code(), err.to_string()),
            Ok(Ok(events)) => {
                let version = events.last().map(|event| event.version);
                metrics::counter!("commands_executed").increment(1);
                CommandResult::ok(command.aggregate_id, version, events)
            }
        };

        metrics::histogram!("command_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    fn reject(&self, command: &Command, code: ErrorCode, message: impl Into<String>) -> CommandResult {
        let message = message.into();
        tracing::warn!(
            command_type = %command.command_type,
            code = %code,
            %message,
            "command failed"
        );
        metrics::counter!("commands_failed", "code" => code.as_str()).increment(1);
        CommandResult::rejected(command.aggregate_id, code, message)
    }
}
