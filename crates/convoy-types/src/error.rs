//! Validation errors and the pipeline failure taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced at job submission. A job that fails validation never
/// creates any pipeline state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("repository must be owner/name: {0}")]
    InvalidRepository(String),

    #[error("ref must be a non-empty branch or tag name: {0}")]
    InvalidRef(String),

    #[error("instance id does not match the provider pattern: {0}")]
    InvalidInstance(String),

    #[error("port must be in 1..=65535")]
    InvalidPort,

    #[error("health path must start with '/': {0}")]
    InvalidHealthPath(String),

    #[error("env var key is not a valid identifier: {0}")]
    InvalidEnvKey(String),

    #[error("image tag violates the tag grammar: {0}")]
    InvalidImageTag(String),

    #[error("malformed id: {0}")]
    MalformedId(String),
}

/// Stable failure kinds carried by phase results, events, and records.
///
/// Kinds, not error types: the coordinator maps a kind to a terminal
/// deployment status, and observers key retry/alerting decisions off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Submission-time input error.
    Input,
    /// VCS, registry, or cloud API unreachable or timed out.
    Unreachable,
    /// Security policy rejected the scan.
    SecurityRejected,
    /// Repository resolved but contains nothing to scan.
    EmptyRepo,
    /// Scanner failed before producing a complete report.
    ScannerError,
    /// Container build failed.
    BuildFailed,
    /// Base image pull flake during build.
    BaseImagePull,
    /// Rollout failed its health window.
    HealthFailed,
    /// Phase exceeded its deadline.
    Timeout,
    /// The per-instance lock was lost mid-deployment.
    LockLost,
    /// Queue store, lock store, or persistence failure.
    Infrastructure,
    /// Explicit caller cancellation.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Input => "input",
            FailureKind::Unreachable => "unreachable",
            FailureKind::SecurityRejected => "security_rejected",
            FailureKind::EmptyRepo => "empty_repo",
            FailureKind::ScannerError => "scanner_error",
            FailureKind::BuildFailed => "build_failed",
            FailureKind::BaseImagePull => "base_image_pull",
            FailureKind::HealthFailed => "health_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::LockLost => "lock_lost",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
