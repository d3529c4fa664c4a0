use chrono::{DateTime, Utc};
use dispatch::{Command, CommandResult, Failure};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SagaId(Uuid);

impl SagaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SagaId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// One step of a saga: the command to run and, optionally, the
/// command that undoes it.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub command: Command,
    pub compensation: Option<Command>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            command,
            compensation: None,
        }
    }

    pub fn compensated_by(mut self, command: Command) -> Self {
        self.compensation = Some(command);
        self
    }
}

/// An ordered, named sequence of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub steps: Vec<StepSpec>,
    /// Caller-supplied run id; generated when unset.
    pub id: Option<SagaId>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
            id: None,
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_id(mut self, id: SagaId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Steps are executing.
    Active,
    /// A step failed; compensation has not started yet.
    Failed,
    /// Compensations are executing in reverse order.
    Compensating,
    /// Terminal. A saga that compensated still ends here, with
    /// `error` set on the run.
    Completed,
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SagaStatus::Active => "Active",
            SagaStatus::Failed => "Failed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
        };
        write!(f, "{s}")
    }
}

/// Execution record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    pub command_type: String,
    pub result: Option<CommandResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.success)
    }
}

/// Execution record of one compensating command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompensation {
    pub step: String,
    pub command_type: String,
    pub success: bool,
    pub error: Option<Failure>,
    pub executed_at: DateTime<Utc>,
}

/// Observable state of one saga run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,

    /// Zero-based index of the step currently (or last) executing.
    pub current_step: usize,
    pub total_steps: usize,

    pub steps: Vec<SagaStep>,

    /// Compensations in execution order, i.e. reverse step order.
    pub compensations: Vec<SagaCompensation>,

    /// The failure that triggered compensation, kept after the saga
    /// reaches Completed.
    pub error: Option<Failure>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Saga {
    pub fn start(saga_type: impl Into<String>, total_steps: usize) -> Self {
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Active,
            current_step: 0,
            total_steps,
            steps: Vec::new(),
            compensations: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the run finished without any step failing.
    pub fn succeeded(&self) -> bool {
        self.status == SagaStatus::Completed && self.error.is_none()
    }
}
