//! Convoy Types - Core types for the deployment pipeline
//!
//! Convoy drives an application from source repository to a running,
//! health-verified container on a target instance. This crate holds the
//! value types shared by every stage of that pipeline.
//!
//! ## Key Concepts
//!
//! - **DeploymentJob**: the submitted unit of work, validated at the edge
//! - **DeploymentRecord**: the persisted lifecycle of one deployment
//! - **PhaseRecord**: one executor invocation (security, build, deploy)
//! - **SecurityDecision**: scan verdict computed from counts and policy
//! - **BuildArtifact**: the container image a build produced
//! - **HealthSample / WindowConfig**: the confirmation-window pass rule
//! - **DeploymentEvent**: the sequenced observability stream
//!
//! Identity is ULID-based throughout. A `deployment_id` is minted once
//! (by the driver or the queue) and every downstream record carries it.

#![deny(unsafe_code)]

pub mod build;
pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod job;
pub mod queue;
pub mod record;
pub mod security;

pub use build::{BuildArtifact, DetectionResult, DockerfileProvenance};
pub use error::{FailureKind, ValidationError};
pub use events::{DeploymentEvent, EventPayload};
pub use health::{HealthSample, StatusClass, WindowConfig, WindowOutcome};
pub use ids::{CommandId, DeploymentId, EnvelopeId, InstanceId, JobId, OwnerToken};
pub use job::{DeploymentJob, EnvVar, Environment, Strategy, TriggeredBy};
pub use queue::QueueEntry;
pub use record::{DeploymentRecord, DeploymentStatus, Phase, PhaseRecord, PhaseStatus};
pub use security::{ScanPolicy, ScanReport, SecurityDecision, Verdict, VulnerabilityCounts};

/// Serde helper for `std::time::Duration` fields, stored as milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
