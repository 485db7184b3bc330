//! Strongly-typed identifiers for Convoy entities
//!
//! All generated IDs are ULID-based and wrapped in newtype structs for
//! type safety. ULIDs sort lexicographically by creation time, which the
//! queue relies on for stable tie-breaking within a priority band.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::ValidationError;
use crate::record::Phase;

/// Unique identifier for a deployment.
///
/// Minted once, by the driver or by the queue at enqueue time, and stable
/// for the deployment's entire lifetime including retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(Ulid);

impl DeploymentId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dep-{}", self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("dep-").unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| ValidationError::MalformedId(s.to_string()))
    }
}

/// Unique identifier for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Ulid);

impl JobId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Unique identifier for a queue envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(Ulid);

impl EnvelopeId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env-{}", self.0)
    }
}

/// Opaque token proving a lock holder's identity for renew and release.
///
/// Fresh per acquisition attempt; a stale holder can never renew or
/// release a lock that has since changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(Ulid);

impl OwnerToken {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Identifier of a target compute instance, in the provider's format.
///
/// Validated at submission: `i-` followed by 3 to 17 lowercase
/// alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let suffix = raw
            .strip_prefix("i-")
            .ok_or_else(|| ValidationError::InvalidInstance(raw.to_string()))?;
        let ok = (3..=17).contains(&suffix.len())
            && suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if ok {
            Ok(Self(raw.to_string()))
        } else {
            Err(ValidationError::InvalidInstance(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lock resource key serializing deployments to this instance.
    pub fn lock_key(&self) -> String {
        format!("instance:{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identifier for one remote command invocation.
///
/// Derived from `(deployment_id, phase, attempt)` plus a step label so
/// that a retried phase re-issues the exact same id and the remote
/// executor can deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(String);

impl CommandId {
    pub fn derive(deployment_id: DeploymentId, phase: Phase, step: &str, attempt: u32) -> Self {
        Self(format!("{}-{}-{}-{}", deployment_id, phase.as_str(), step, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_ids_are_unique() {
        let a = DeploymentId::generate();
        let b = DeploymentId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn deployment_id_round_trips_through_display() {
        let id = DeploymentId::generate();
        let parsed: DeploymentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn instance_id_accepts_provider_format() {
        assert!(InstanceId::parse("i-abc").is_ok());
        assert!(InstanceId::parse("i-0f1e2d3c4b5a69788").is_ok());
    }

    #[test]
    fn instance_id_rejects_malformed_input() {
        assert!(InstanceId::parse("abc").is_err());
        assert!(InstanceId::parse("i-").is_err());
        assert!(InstanceId::parse("i-AB").is_err());
        assert!(InstanceId::parse("i-0f1e2d3c4b5a697881").is_err());
    }

    #[test]
    fn command_id_is_deterministic() {
        let id = DeploymentId::generate();
        let a = CommandId::derive(id, Phase::Deploy, "prep", 1);
        let b = CommandId::derive(id, Phase::Deploy, "prep", 1);
        assert_eq!(a, b);
        let c = CommandId::derive(id, Phase::Deploy, "prep", 2);
        assert_ne!(a, c);
    }
}
