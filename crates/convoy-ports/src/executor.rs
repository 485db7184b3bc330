//! Remote-execution port

use async_trait::async_trait;
use std::time::Duration;

use convoy_types::{CommandId, InstanceId};

use crate::error::ExecError;

/// Outcome of one remote script run.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs scripts on a target instance.
///
/// Implementations provide at-most-once invocation per `command_id`:
/// re-issuing a command id the instance has already executed returns the
/// recorded outcome instead of running the script again. The caller
/// derives command ids from `(deployment_id, phase, step, attempt)` —
/// one per script a phase attempt issues — so that retries are
/// idempotent.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        instance_id: &InstanceId,
        command_id: &CommandId,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;
}
