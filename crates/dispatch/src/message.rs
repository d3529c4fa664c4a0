use std::time::Duration;

use chrono::{DateTime, Utc};
use event_store::{AggregateId, EventEnvelope, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCode, Failure};

/// Caller-supplied context travelling with a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Optimistic concurrency guard forwarded to the store on append.
    pub expected_version: Option<Version>,

    /// Correlates every message in one logical flow (e.g. a saga run).
    pub correlation_id: Option<Uuid>,

    /// The message that directly caused this command.
    pub causation_id: Option<Uuid>,

    /// Free-form origin tag ("api", "saga:order-fulfillment", ...).
    pub origin: Option<String>,

    pub issued_at: DateTime<Utc>,

    /// Per-command deadline override; the dispatcher default applies
    /// when unset.
    pub deadline: Option<Duration>,
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self {
            expected_version: None,
            correlation_id: None,
            causation_id: None,
            origin: None,
            issued_at: Utc::now(),
            deadline: None,
        }
    }
}

/// An intent to change one aggregate, routed by `command_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub command_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub payload: Value,
    pub metadata: CommandMetadata,
}

impl Command {
    pub fn new(
        command_type: impl Into<String>,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type: command_type.into(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            payload,
            metadata: CommandMetadata::default(),
        }
    }

    /// Sets the optimistic concurrency guard.
    pub fn expected_version(mut self, version: Version) -> Self {
        self.metadata.expected_version = Some(version);
        self
    }

    /// Sets a per-command deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.metadata.deadline = Some(deadline);
        self
    }

    /// Tags the command with a correlation id.
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    /// Records where the command came from.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.metadata.origin = Some(origin.into());
        self
    }
}

/// Outcome of command execution. Failures are values, never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub aggregate_id: AggregateId,

    /// Stream version after the command, when known.
    pub version: Option<Version>,

    /// Events the command appended, in stream order.
    pub events: Vec<EventEnvelope>,

    pub error: Option<Failure>,
}

impl CommandResult {
    /// A successful result carrying the appended events.
    pub fn ok(aggregate_id: AggregateId, version: Option<Version>, events: Vec<EventEnvelope>) -> Self {
        Self {
            success: true,
            aggregate_id,
            version,
            events,
            error: None,
        }
    }

    /// A failed result with a typed error.
    pub fn rejected(aggregate_id: AggregateId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            aggregate_id,
            version: None,
            events: Vec::new(),
            error: Some(Failure::new(code, message)),
        }
    }
}

/// A read request, routed by `query_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub query_type: String,
    pub params: Value,
}

impl Query {
    pub fn new(query_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_type: query_type.into(),
            params,
        }
    }
}

/// What a query handler returns on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Value,

    /// Version of the projection the answer was read from, when the
    /// handler tracks one.
    pub projection_version: Option<u64>,

    pub last_modified: Option<DateTime<Utc>>,
}

impl QueryResponse {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            projection_version: None,
            last_modified: None,
        }
    }

    pub fn with_projection_version(mut self, version: u64) -> Self {
        self.projection_version = Some(version);
        self
    }

    pub fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }
}

/// Whether a query answer came from the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Caching is not configured for this query type.
    Bypass,
}

/// Outcome of query execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<Failure>,
    pub cache_status: CacheStatus,
    pub projection_version: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl QueryResult {
    /// A successful result built from the handler's response.
    pub fn ok(response: QueryResponse, cache_status: CacheStatus) -> Self {
        Self {
            success: true,
            data: Some(response.data),
            error: None,
            cache_status,
            projection_version: response.projection_version,
            last_modified: response.last_modified,
        }
    }

    /// A failed result with a typed error.
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(Failure::new(code, message)),
            cache_status: CacheStatus::Bypass,
            projection_version: None,
            last_modified: None,
        }
    }
}
