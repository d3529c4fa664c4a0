use event_store::{EventStoreError, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The dispatch-boundary error taxonomy.
///
/// Every failed command or query carries exactly one of these codes so
/// callers can branch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The command failed its registered validation predicate.
    ValidationFailed,

    /// The command failed its registered authorization predicate.
    AuthorizationFailed,

    /// No handler is registered for the message type.
    NotFound,

    /// The registered handler is toggled off.
    Disabled,

    /// An optimistic version check failed on append.
    ConcurrencyConflict,

    /// The handler itself failed; caught at the dispatch boundary.
    HandlerError,

    /// The deadline elapsed. Events already appended remain durable:
    /// callers must treat the outcome as unknown and reconcile via an
    /// idempotent retry with `expected_version`.
    Timeout,
}

impl ErrorCode {
    /// Returns the code name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "ValidationFailed",
            ErrorCode::AuthorizationFailed => "AuthorizationFailed",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Disabled => "Disabled",
            ErrorCode::ConcurrencyConflict => "ConcurrencyConflict",
            ErrorCode::HandlerError => "HandlerError",
            ErrorCode::Timeout => "Timeout",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed failure attached to a [`CommandResult`](crate::CommandResult)
/// or [`QueryResult`](crate::QueryResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub code: ErrorCode,
    pub message: String,
}

impl Failure {
    /// Creates a failure with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Error returned from inside a command, query, or event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler's append lost an optimistic concurrency race.
    #[error("concurrency conflict: expected version {expected}, found {actual}")]
    Conflict { expected: Version, actual: Version },

    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Creates a generic handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Maps the handler error onto the dispatch taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Conflict { .. } => ErrorCode::ConcurrencyConflict,
            HandlerError::Failed(_) => ErrorCode::HandlerError,
        }
    }
}

impl From<EventStoreError> for HandlerError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyConflict {
                expected, actual, ..
            } => HandlerError::Conflict { expected, actual },
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Failed(err.to_string())
    }
}
