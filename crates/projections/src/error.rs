use event_store::EventStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("projection not found: {0}")]
    NotFound(String),

    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
