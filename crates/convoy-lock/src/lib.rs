//! Convoy Lock - Per-instance mutual exclusion
//!
//! Deployments to the same instance must never overlap. Workers enforce
//! that with a single-resource mutex on `instance:<instance_id>`, backed
//! by any key-value store offering atomic set-if-absent with TTL.
//!
//! Owner tokens are fresh ULIDs per acquisition attempt: renew and
//! release verify ownership, so a worker that lost its lease can never
//! clobber the next holder. The [`LockGuard`] renews in the background
//! at a third of the TTL and cancels its holder's work the moment a
//! renewal fails.

#![deny(unsafe_code)]

mod backend;
mod guard;

pub use backend::{InMemoryLockBackend, LockBackend, LockError};
pub use guard::{InstanceLock, LockConfig, LockGuard};
