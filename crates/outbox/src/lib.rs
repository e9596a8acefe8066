//! Durable outbox for side effects that must survive restarts.
//!
//! Producers write rows through an [`OutboxStore`]; the [`OutboxDispatcher`]
//! claims pending rows oldest-first and hands each to the handler registered
//! for its task type.

pub mod dispatcher;
pub mod memory;
pub mod store;

pub use dispatcher::{
    DispatchError, DispatchReport, HandleOutcome, HandlerError, HandlerRegistry, OutboxDispatcher,
    OutboxHandler,
};
pub use memory::MemoryOutboxStore;
pub use store::{EnqueueRequest, OutboxStore, PgOutboxStore};
