//! Command, query, and event dispatch for the CQRS engine.
//!
//! The write side routes [`Command`]s through registered handlers that
//! append events via the [`DispatchingStore`]; the read side routes
//! [`Query`]s to handlers over projections, with optional result caching.
//! Appended events fan out through the [`EventDispatcher`] with per-handler
//! retry, backoff, and dead-lettering.
//!
//! Failures at the dispatch boundary are returned as typed results
//! ([`CommandResult`] / [`QueryResult`]) carrying an [`ErrorCode`]; they
//! are never propagated as panics.

pub mod command;
pub mod error;
pub mod event;
pub mod message;
pub mod query;
pub mod retry;
pub mod store;

pub use command::{CommandDispatcher, CommandHandler, CommandPredicate};
pub use error::{ErrorCode, Failure, HandlerError};
pub use event::{DeadLetter, DeadLetterQueue, EventDispatcher, EventHandler, EventSink};
pub use message::{
    CacheStatus, Command, CommandMetadata, CommandResult, Query, QueryResponse, QueryResult,
};
pub use query::{CachePolicy, QueryDispatcher, QueryHandler};
pub use retry::{Backoff, RetryPolicy};
pub use store::DispatchingStore;
