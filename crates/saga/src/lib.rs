//! Saga orchestration over the command dispatcher.
//!
//! A [`SagaDefinition`] is an ordered list of steps, each a command
//! with an optional compensating command. The [`SagaOrchestrator`]
//! runs steps sequentially; on the first failure it stops, runs the
//! compensations of every completed step in reverse order, and
//! finishes the saga as Completed with the original error attached.

pub mod error;
pub mod orchestrator;
pub mod state;

pub use error::{Result, SagaError};
pub use orchestrator::SagaOrchestrator;
pub use state::{
    Saga, SagaCompensation, SagaDefinition, SagaId, SagaStatus, SagaStep, StepSpec,
};
