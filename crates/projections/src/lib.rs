//! Read-model projections folded from the event log.
//!
//! A [`ProjectionDefinition`] declares which event types it consumes
//! and a fold per type; the [`ProjectionEngine`] keeps one
//! [`ProjectionState`] per definition, applies each stream's events at
//! most once, and can rebuild any projection from the full log.

pub mod engine;
pub mod error;
pub mod projection;

pub use engine::ProjectionEngine;
pub use error::{ProjectionError, Result};
pub use projection::{FoldFn, ProjectionDefinition, ProjectionState, ProjectionStatus};
