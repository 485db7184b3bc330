//! The sequenced observability stream
//!
//! Every pipeline transition publishes one `DeploymentEvent`. Within a
//! deployment, `seq` is strictly increasing and gap-free as published;
//! subscribers on the `disconnect` overflow policy observe it gap-free up
//! to a final `Overflow` marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::health::HealthSample;
use crate::ids::DeploymentId;
use crate::record::{DeploymentRecord, DeploymentStatus, Phase};

/// One event in a deployment's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    /// Strictly increasing within a deployment, assigned by the bus.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    PhaseStarted {
        phase: Phase,
        attempt: u32,
    },
    /// Progress inside a phase, e.g. a rollout stage transition.
    PhaseProgress {
        phase: Phase,
        stage: String,
        detail: Option<String>,
    },
    PhaseCompleted {
        phase: Phase,
        attempt: u32,
    },
    PhaseFailed {
        phase: Phase,
        attempt: u32,
        kind: FailureKind,
        detail: String,
    },
    HealthSampled {
        sample: HealthSample,
    },
    RollbackStarted {
        reason: String,
        previous_image_tag: Option<String>,
    },
    /// Deployment-level status transition. The terminal one is the last
    /// event a deployment ever publishes.
    StatusChanged {
        status: DeploymentStatus,
        reason: Option<String>,
    },
    /// A build output line, rate-capped at the source.
    LogLine {
        line: String,
    },
    /// First event of every subscription: the current record.
    Snapshot {
        record: Box<DeploymentRecord>,
    },
    /// Final event before a strict subscriber is disconnected.
    Overflow {
        dropped: u64,
    },
}

impl EventPayload {
    /// Short label used in logs and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::PhaseStarted { .. } => "phase_started",
            EventPayload::PhaseProgress { .. } => "phase_progress",
            EventPayload::PhaseCompleted { .. } => "phase_completed",
            EventPayload::PhaseFailed { .. } => "phase_failed",
            EventPayload::HealthSampled { .. } => "health_sampled",
            EventPayload::RollbackStarted { .. } => "rollback_started",
            EventPayload::StatusChanged { .. } => "status_changed",
            EventPayload::LogLine { .. } => "log_line",
            EventPayload::Snapshot { .. } => "snapshot",
            EventPayload::Overflow { .. } => "overflow",
        }
    }

    /// Whether this payload ends the stream for its deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::StatusChanged { status, .. } if status.is_terminal()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_changed_is_terminal() {
        let terminal = EventPayload::StatusChanged {
            status: DeploymentStatus::Deployed,
            reason: None,
        };
        assert!(terminal.is_terminal());

        let transition = EventPayload::StatusChanged {
            status: DeploymentStatus::Building,
            reason: None,
        };
        assert!(!transition.is_terminal());
    }

    #[test]
    fn payload_serializes_with_tag() {
        let payload = EventPayload::PhaseStarted {
            phase: Phase::Security,
            attempt: 1,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "phase_started");
        assert_eq!(json["phase"], "security");
    }
}
