//! Convoy Queue - Per-environment deployment queues
//!
//! Each environment owns a FIFO with a small number of priority bands
//! and a processing list per popped entry. Pop atomically moves an entry
//! from pending to processing; ack removes it; nack re-enqueues with
//! exponential backoff up to `max_retries`. A recovery sweeper returns
//! entries whose worker died to the pending list once their visibility
//! timeout lapses, giving at-least-once delivery.

#![deny(unsafe_code)]

mod queue;

pub use queue::{DeploymentQueue, QueueConfig, QueueError, RequeueOutcome};
