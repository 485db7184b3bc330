//! Queue envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EnvelopeId, OwnerToken};
use crate::job::DeploymentJob;

/// One entry in a deployment queue.
///
/// Pending entries have no `processing_owner`; popping an entry stamps
/// the worker's token and moves it to the processing list, where the
/// recovery sweeper can find it if the worker dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub envelope_id: EnvelopeId,
    pub job: DeploymentJob,
    pub enqueued_at: DateTime<Utc>,
    /// Worker currently holding this entry, if any.
    pub processing_owner: Option<OwnerToken>,
    /// Entries are invisible to `pop` until this instant. Used for
    /// delayed requeue with backoff.
    pub visible_after: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job: DeploymentJob, now: DateTime<Utc>) -> Self {
        Self {
            envelope_id: EnvelopeId::generate(),
            job,
            enqueued_at: now,
            processing_owner: None,
            visible_after: now,
        }
    }
}
