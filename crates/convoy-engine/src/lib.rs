//! Convoy Engine - The pipeline put together
//!
//! The engine owns the deployment-level state machine and everything
//! around it:
//!
//! - [`Coordinator`]: drives one job through Scanning, Building,
//!   Deploying, and Verifying, with phase timeouts, cancellation, and a
//!   terminal status whose `StatusChanged` event is the last write.
//! - [`Worker`]: pops jobs, takes the per-instance lock, runs the
//!   coordinator, and acks or nacks.
//! - [`Orchestrator`]: the driver facade — submit jobs, read records,
//!   subscribe to event streams that open with a snapshot.
//! - [`ConvoyConfig`]: the whole recognized configuration surface,
//!   loadable from TOML.
//!
//! Scheduling model: many workers, one task per deployment. Everything
//! a deployment does happens on its worker's task, so the state machine
//! is linearizable per `deployment_id`; fan-out below that (parallel
//! canary probes) is scoped inside the phases.

#![deny(unsafe_code)]

mod config;
mod coordinator;
mod error;
mod orchestrator;
mod worker;

pub use config::{ConvoyConfig, PhaseTimeouts, WebhookTarget};
pub use coordinator::{Coordinator, RunDisposition};
pub use error::{EngineError, Result};
pub use orchestrator::{EventStream, Orchestrator, WebhookEvent};
pub use worker::Worker;
