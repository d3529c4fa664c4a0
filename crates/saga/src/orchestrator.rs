use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dispatch::CommandDispatcher;
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};
use crate::state::{
    Saga, SagaCompensation, SagaDefinition, SagaId, SagaStatus, SagaStep, StepSpec,
};

/// Runs sagas over the command dispatcher and keeps every run
/// observable while it executes.
///
/// Steps run strictly in order with no per-step retries: a failed
/// step fails the saga immediately. Compensation is best effort, in
/// reverse order of the steps that succeeded; a failing compensation
/// is recorded and the rest still run.
pub struct SagaOrchestrator {
    commands: Arc<CommandDispatcher>,
    sagas: RwLock<HashMap<SagaId, Saga>>,
}

impl SagaOrchestrator {
    pub fn new(commands: Arc<CommandDispatcher>) -> Self {
        Self {
            commands,
            sagas: RwLock::new(HashMap::new()),
        }
    }

    /// Runs `definition` to completion and returns the final state.
    /// The run is visible through [`get`](Self::get) while in flight.
    #[tracing::instrument(skip(self, definition), fields(saga_type = %definition.saga_type))]
    pub async fn run(&self, definition: SagaDefinition) -> Result<Saga> {
        if definition.steps.is_empty() {
            return Err(SagaError::EmptyDefinition);
        }

        let clock = std::time::Instant::now();
        let mut saga = Saga::start(&definition.saga_type, definition.steps.len());
        if let Some(id) = definition.id {
            if self.sagas.read().await.contains_key(&id) {
                return Err(SagaError::AlreadyExists(id));
            }
            saga.id = id;
        }
        let saga_id = saga.id;
        tracing::info!(saga_id = %saga_id, steps = saga.total_steps, "saga started");
        metrics::counter!("sagas_started").increment(1);
        self.publish(&saga).await;

        let mut completed: Vec<&StepSpec> = Vec::new();
        let mut failed = false;

        for (index, spec) in definition.steps.iter().enumerate() {
            saga.current_step = index;
            let mut record = SagaStep {
                name: spec.name.clone(),
                command_type: spec.command.command_type.clone(),
                result: None,
                started_at: Utc::now(),
                finished_at: None,
            };
            saga.steps.push(record.clone());
            self.publish(&saga).await;

            let command = spec
                .command
                .clone()
                .correlated(saga_id.as_uuid())
                .origin(format!("saga:{}", definition.saga_type));
            let result = self.commands.execute(command).await;

            record.finished_at = Some(Utc::now());
            record.result = Some(result.clone());
            *saga.steps.last_mut().unwrap() = record;

            if result.success {
                completed.push(spec);
                self.publish(&saga).await;
                continue;
            }

            tracing::warn!(
                saga_id = %saga_id,
                step = %spec.name,
                error = %result.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown"),
                "saga step failed"
            );
            saga.error = result.error;
            saga.status = SagaStatus::Failed;
            failed = true;
            self.publish(&saga).await;
            break;
        }

        if failed {
            self.compensate(&mut saga, &completed).await;
            metrics::counter!("sagas_compensated").increment(1);
        } else {
            metrics::counter!("sagas_succeeded").increment(1);
        }

        saga.status = SagaStatus::Completed;
        saga.finished_at = Some(Utc::now());
        metrics::histogram!("saga_duration_seconds").record(clock.elapsed().as_secs_f64());
        tracing::info!(
            saga_id = %saga_id,
            succeeded = saga.succeeded(),
            compensations = saga.compensations.len(),
            "saga finished"
        );
        self.publish(&saga).await;
        Ok(saga)
    }

    /// Runs compensations for `completed` steps in reverse order.
    async fn compensate(&self, saga: &mut Saga, completed: &[&StepSpec]) {
        saga.status = SagaStatus::Compensating;
        self.publish(saga).await;

        for spec in completed.iter().rev() {
            let Some(compensation) = &spec.compensation else {
                continue;
            };
            let command = compensation
                .clone()
                .correlated(saga.id.as_uuid())
                .origin(format!("saga:{}:compensation", saga.saga_type));
            let command_type = command.command_type.clone();
            let result = self.commands.execute(command).await;

            if !result.success {
                tracing::error!(
                    saga_id = %saga.id,
                    step = %spec.name,
                    "compensation failed, continuing with the rest"
                );
            }
            saga.compensations.push(SagaCompensation {
                step: spec.name.clone(),
                command_type,
                success: result.success,
                error: result.error,
                executed_at: Utc::now(),
            });
            self.publish(saga).await;
        }
    }

    async fn publish(&self, saga: &Saga) {
        self.sagas.write().await.insert(saga.id, saga.clone());
    }

    /// Current state of one saga run.
    pub async fn get(&self, id: SagaId) -> Result<Saga> {
        self.sagas
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SagaError::NotFound(id))
    }

    /// All known runs, most recently started first.
    pub async fn list(&self) -> Vec<Saga> {
        let sagas = self.sagas.read().await;
        let mut runs: Vec<Saga> = sagas.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    pub async fn count(&self) -> usize {
        self.sagas.read().await.len()
    }
}
