use thiserror::Error;

use crate::state::SagaId;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("saga not found: {0}")]
    NotFound(SagaId),

    #[error("saga already exists: {0}")]
    AlreadyExists(SagaId),

    #[error("saga definition has no steps")]
    EmptyDefinition,
}

pub type Result<T> = std::result::Result<T, SagaError>;
