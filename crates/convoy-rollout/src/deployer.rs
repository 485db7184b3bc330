//! The deployer contract

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use convoy_types::{DeploymentId, EnvVar, InstanceId, Strategy};

use crate::canary::CanaryDeployer;
use crate::config::{CanaryConfig, DeployConfig};
use crate::context::RolloutContext;
use crate::rolling::RollingDeployer;

/// Everything a strategy needs to ship one artifact.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub deployment_id: DeploymentId,
    pub instance_id: InstanceId,
    pub image_tag: String,
    /// Tag serving before this rollout, if the instance has one. Already
    /// persisted on the deployment record before the strategy runs.
    pub previous_image_tag: Option<String>,
    pub port: u16,
    pub health_path: String,
    pub env_vars: Vec<EnvVar>,
    /// Phase attempt, woven into command ids for idempotent retries.
    pub attempt: u32,
}

impl DeployRequest {
    /// Candidate container name: deterministic per image version.
    pub fn candidate_name(&self) -> String {
        let version = self.image_tag.split(':').nth(1).unwrap_or("unknown");
        let short = &version[..version.len().min(8)];
        format!("app-candidate-{short}")
    }

    /// Name of the container occupying the application port.
    pub fn current_name(&self) -> String {
        format!("app-{}", self.port)
    }

    /// Side port the candidate starts on.
    pub fn side_port(&self) -> u16 {
        self.port.saturating_add(1)
    }

    pub fn health_url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.instance_id, port, self.health_path)
    }
}

/// How a rollout ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The new container serves on the application port, both windows
    /// passed.
    Succeeded {
        container_id: String,
        elapsed: Duration,
    },
    /// The rollout failed and the previous image was restored.
    FailedAndRolledBack { reason: String },
    /// The rollout failed with nothing to restore (first deployment to
    /// the instance, or no change had been made yet).
    FailedNoRollback { reason: String },
}

/// Infrastructure failures that abort a rollout without a business
/// verdict. Health failures are not errors; they come back as
/// [`DeployOutcome::FailedAndRolledBack`].
#[derive(Debug, Clone, Error)]
pub enum DeployError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("rollback failed after {reason}: {detail}")]
    RollbackFailed { reason: String, detail: String },

    #[error("event stream failure: {0}")]
    EventStream(String),

    #[error("rollout cancelled (rolled_back: {rolled_back})")]
    Cancelled { rolled_back: bool },
}

pub type Result<T> = std::result::Result<T, DeployError>;

/// Common contract for rollout strategies.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, ctx: &RolloutContext, req: &DeployRequest) -> Result<DeployOutcome>;

    fn name(&self) -> &'static str;
}

/// Pick the deployer for a job's strategy.
pub fn create_deployer(
    strategy: Strategy,
    deploy: DeployConfig,
    canary: CanaryConfig,
) -> Arc<dyn Deployer> {
    match strategy {
        Strategy::Rolling => Arc::new(RollingDeployer::new(deploy)),
        Strategy::Canary => Arc::new(CanaryDeployer::new(deploy, canary)),
    }
}
