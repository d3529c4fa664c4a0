//! Append-only event store for the CQRS engine.
//!
//! The store is modeled as an ordered, durable, append-only log per
//! aggregate. Appends assign both a per-stream [`Version`] and a global
//! [`Sequence`], enforce optimistic concurrency, and snapshot streams that
//! grow past a configurable threshold. [`MemoryEventStore`] is the
//! reference implementation; any backend offering atomic per-stream append
//! with version checking can implement [`EventStore`].

pub mod error;
pub mod event;
pub mod memory;
pub mod query;
pub mod snapshot;
pub mod store;
pub mod stream;

pub use error::{EventStoreError, Result};
pub use event::{AggregateId, EventEnvelope, EventId, NewEvent, Sequence, Version};
pub use memory::MemoryEventStore;
pub use query::EventQuery;
pub use snapshot::{Snapshot, SnapshotPolicy};
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream, StoreStats};
pub use stream::StreamState;
