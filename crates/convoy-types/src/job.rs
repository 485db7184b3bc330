//! The submitted unit of work
//!
//! A `DeploymentJob` arrives from a driver (CLI, webhook, API) already
//! stripped of transport concerns. Validation happens here, at the edge;
//! a job that fails validation never creates any pipeline state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{DeploymentId, InstanceId, JobId};

/// A request to deploy one commit of a repository to one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Stable job identity.
    pub job_id: JobId,

    /// Canonical deployment identity. Supplied by the driver or minted by
    /// the queue at enqueue time; every downstream record references it.
    pub deployment_id: Option<DeploymentId>,

    /// Source repository as `owner/name`.
    pub repository: String,

    /// Branch or tag to deploy.
    pub git_ref: String,

    /// Commit sha, if the driver already resolved it. Resolved during the
    /// security phase otherwise.
    pub commit_sha: Option<String>,

    /// Target compute instance.
    pub instance_id: InstanceId,

    /// Deployment environment.
    pub environment: Environment,

    /// Rollout strategy.
    pub strategy: Strategy,

    /// Application port on the instance.
    pub port: u16,

    /// Health endpoint path, e.g. `/healthz`.
    pub health_path: String,

    /// Environment variables, in submission order.
    pub env_vars: Vec<EnvVar>,

    /// Queue priority band (0 = lowest).
    pub priority: u8,

    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,

    /// What submitted this job.
    pub triggered_by: TriggeredBy,

    /// Number of times this job has been requeued.
    pub retry_count: u32,
}

impl DeploymentJob {
    /// Validate every driver-supplied field. Called once at submission.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_repository(&self.repository)?;
        if self.git_ref.is_empty() || self.git_ref.contains(char::is_whitespace) {
            return Err(ValidationError::InvalidRef(self.git_ref.clone()));
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if !self.health_path.starts_with('/') {
            return Err(ValidationError::InvalidHealthPath(self.health_path.clone()));
        }
        for var in &self.env_vars {
            var.validate()?;
        }
        Ok(())
    }

    /// The repository name sanitized for use as an image name.
    pub fn sanitized_repo(&self) -> String {
        crate::build::sanitize_repo(&self.repository)
    }
}

/// One environment variable handed to the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    /// Secret values are encrypted at rest and redacted from every
    /// persisted row and published event.
    #[serde(default)]
    pub secret: bool,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret: true,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut chars = self.key.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if head_ok && tail_ok {
            Ok(())
        } else {
            Err(ValidationError::InvalidEnvKey(self.key.clone()))
        }
    }
}

/// Closed set of deployment environments. Each has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Staging,
    Preview,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Preview => "preview",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rollout strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Rolling,
    Canary,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Rolling => write!(f, "rolling"),
            Strategy::Canary => write!(f, "canary"),
        }
    }
}

/// What submitted a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Cli,
    Webhook,
    Api,
    Retry,
}

fn validate_repository(repo: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidRepository(repo.to_string());
    let (owner, name) = repo.split_once('/').ok_or_else(invalid)?;
    for part in [owner, name] {
        if part.is_empty() || part.starts_with(['.', '-']) {
            return Err(invalid());
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid());
        }
    }
    if name.contains('/') {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DeploymentJob {
        DeploymentJob {
            job_id: JobId::generate(),
            deployment_id: None,
            repository: "octo/api".into(),
            git_ref: "main".into(),
            commit_sha: None,
            instance_id: InstanceId::parse("i-abc").unwrap(),
            environment: Environment::Production,
            strategy: Strategy::Rolling,
            port: 8080,
            health_path: "/health".into(),
            env_vars: vec![],
            priority: 0,
            submitted_at: Utc::now(),
            triggered_by: TriggeredBy::Cli,
            retry_count: 0,
        }
    }

    #[test]
    fn valid_job_passes() {
        assert!(job().validate().is_ok());
    }

    #[test]
    fn rejects_bad_repository() {
        for repo in ["", "octo", "octo/", "/api", "octo/a pi", "-octo/api", "a/b/c"] {
            let mut j = job();
            j.repository = repo.into();
            assert!(j.validate().is_err(), "accepted {repo:?}");
        }
    }

    #[test]
    fn rejects_zero_port() {
        let mut j = job();
        j.port = 0;
        assert_eq!(j.validate(), Err(ValidationError::InvalidPort));
    }

    #[test]
    fn rejects_relative_health_path() {
        let mut j = job();
        j.health_path = "health".into();
        assert!(j.validate().is_err());
    }

    #[test]
    fn rejects_bad_env_key() {
        let mut j = job();
        j.env_vars = vec![EnvVar::new("1BAD", "x")];
        assert!(j.validate().is_err());
        j.env_vars = vec![EnvVar::new("GOOD_KEY", "x")];
        assert!(j.validate().is_ok());
    }
}
