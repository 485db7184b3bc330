//! Convoy Audit - Append-only gateway over the store port
//!
//! Everything the pipeline persists flows through this gateway: status
//! transitions, phase rows, scan decisions, build artifacts, health
//! samples, and the event trail. The gateway batches health samples per
//! phase and flushes on phase exit and terminal transitions, applies the
//! idempotence contract of the underlying store, and scrubs secrets from
//! every string before it leaves the process.

#![deny(unsafe_code)]

mod gateway;
mod redact;

pub use gateway::{AuditError, AuditGateway, Result};
pub use redact::Redactor;
