//! Persisted deployment lifecycle
//!
//! The coordinator is the sole writer of a `DeploymentRecord`. Phase
//! executors report through `PhaseRecord`s, one pair of rows (entry and
//! exit) per invocation, sharing a single attempt index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::FailureKind;
use crate::ids::{DeploymentId, InstanceId, JobId};
use crate::job::{Environment, Strategy};

/// Deployment-level status machine.
///
/// `Deployed`, `Failed`, `Rejected`, `RolledBack`, and `Cancelled` are
/// terminal: once a record carries one of them it is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Scanning,
    Building,
    Deploying,
    Verifying,
    RollingBack,
    Deployed,
    Failed,
    Rejected,
    RolledBack,
    Cancelled,
}

impl DeploymentStatus {
    /// Whether this status permits no further writes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deployed
                | DeploymentStatus::Failed
                | DeploymentStatus::Rejected
                | DeploymentStatus::RolledBack
                | DeploymentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Scanning => "scanning",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Verifying => "verifying",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Rejected => "rejected",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Security,
    Build,
    Deploy,
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Security => "security",
            Phase::Build => "build",
            Phase::Deploy => "deploy",
            Phase::Verify => "verify",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one phase invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Succeeded,
    Skipped,
    Failed,
}

/// One executor invocation. Written on entry (`Running`) and rewritten on
/// exit under the same `(deployment_id, phase, attempt)` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub deployment_id: DeploymentId,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure kind and human detail, present when `status` is `Failed`.
    pub failure: Option<(FailureKind, String)>,
    /// Phase-specific payload: scan summary, image digest, health series,
    /// canary stages completed. Shape is owned by the producing phase.
    pub payload: Option<serde_json::Value>,
}

impl PhaseRecord {
    /// The entry row written when a phase starts.
    pub fn started(deployment_id: DeploymentId, phase: Phase, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            deployment_id,
            phase,
            status: PhaseStatus::Running,
            attempt,
            started_at: now,
            finished_at: None,
            failure: None,
            payload: None,
        }
    }
}

/// The persisted lifecycle of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: DeploymentId,
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub environment: Environment,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    /// Image tag serving on the instance before this deployment, if any.
    /// Persisted strictly before any step that could obscure it.
    pub previous_image_tag: Option<String>,
    /// Image tag this deployment produced.
    pub current_image_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of each completed phase.
    #[serde(with = "phase_durations_serde")]
    pub phase_durations: BTreeMap<Phase, Duration>,
    pub failure_reason: Option<(FailureKind, String)>,
    pub rollback_reason: Option<String>,
}

impl DeploymentRecord {
    /// A fresh record, created when the coordinator enters `Scanning`.
    pub fn new(
        deployment_id: DeploymentId,
        job_id: JobId,
        instance_id: InstanceId,
        environment: Environment,
        strategy: Strategy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            deployment_id,
            job_id,
            instance_id,
            environment,
            strategy,
            status: DeploymentStatus::Scanning,
            previous_image_tag: None,
            current_image_tag: None,
            started_at: now,
            completed_at: None,
            phase_durations: BTreeMap::new(),
            failure_reason: None,
            rollback_reason: None,
        }
    }
}

mod phase_durations_serde {
    use super::Phase;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &BTreeMap<Phase, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: BTreeMap<Phase, u64> = map
            .iter()
            .map(|(phase, d)| (*phase, d.as_millis() as u64))
            .collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<Phase, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = BTreeMap::<Phase, u64>::deserialize(deserializer)?;
        Ok(millis
            .into_iter()
            .map(|(phase, ms)| (phase, Duration::from_millis(ms)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(DeploymentStatus::Deployed.is_terminal());
        assert!(DeploymentStatus::Rejected.is_terminal());
        assert!(DeploymentStatus::RolledBack.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
        assert!(!DeploymentStatus::Deploying.is_terminal());
        assert!(!DeploymentStatus::RollingBack.is_terminal());
    }

    #[test]
    fn record_serializes_durations_as_millis() {
        let mut record = DeploymentRecord::new(
            DeploymentId::generate(),
            JobId::generate(),
            InstanceId::parse("i-abc").unwrap(),
            Environment::Staging,
            Strategy::Rolling,
            Utc::now(),
        );
        record
            .phase_durations
            .insert(Phase::Build, Duration::from_secs(42));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["phase_durations"]["build"], 42_000);
    }
}
