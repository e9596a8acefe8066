//! Email delivery: the in-memory queue, the single delivery worker with its
//! backoff and retry scheduling, mail transports, and the outbox handler that
//! feeds the queue.

pub mod backoff;
pub mod handler;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod worker;
