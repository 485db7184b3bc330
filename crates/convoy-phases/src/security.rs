//! Security phase
//!
//! Clone the repository into a per-attempt scratch directory, scan the
//! worktree, and turn the counts into a policy decision. The scratch
//! directory is a `TempDir` owned by the phase output; it is removed on
//! drop, on every exit path including panic, once the build no longer
//! needs the worktree.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

use convoy_ports::{ImageScanner, ScanError, Vcs, VcsError};
use convoy_types::{
    DeploymentJob, FailureKind, Phase, ScanPolicy, SecurityDecision, Verdict,
};

use crate::recorder::PhaseRecorder;
use crate::result::PhaseResult;

/// Security-phase tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub policy: ScanPolicy,
    /// High findings beyond this reject under every policy.
    pub max_high: u32,
    #[serde(with = "convoy_types::duration_millis")]
    pub timeout: Duration,
    /// Globs pruned before scanning.
    pub skip_dirs: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy: ScanPolicy::default(),
            max_high: 5,
            timeout: Duration::from_secs(120),
            skip_dirs: vec![
                "node_modules/**".into(),
                "vendor/**".into(),
                "target/**".into(),
                ".venv/**".into(),
                "__pycache__/**".into(),
                ".git/**".into(),
            ],
        }
    }
}

/// What a passing security phase hands to the build.
pub struct SecurityOutput {
    pub decision: SecurityDecision,
    pub resolved_sha: String,
    /// The cloned worktree. Dropping this removes the scratch directory.
    pub worktree: TempDir,
}

pub struct SecurityPhase {
    vcs: Arc<dyn Vcs>,
    scanner: Arc<dyn ImageScanner>,
    recorder: Arc<PhaseRecorder>,
    config: SecurityConfig,
}

impl SecurityPhase {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        scanner: Arc<dyn ImageScanner>,
        recorder: Arc<PhaseRecorder>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            vcs,
            scanner,
            recorder,
            config,
        }
    }

    #[instrument(skip(self, job), fields(deployment_id = %deployment_id, repository = %job.repository))]
    pub async fn run(
        &self,
        deployment_id: convoy_types::DeploymentId,
        job: &DeploymentJob,
        attempt: u32,
    ) -> Result<PhaseResult<SecurityOutput>, convoy_audit::AuditError> {
        let entry = self
            .recorder
            .enter(deployment_id, Phase::Security, attempt)
            .await?;

        let result = self.execute(deployment_id, job, attempt).await;
        match &result {
            PhaseResult::Ok(output) => {
                let payload = serde_json::to_value(&output.decision).ok();
                self.recorder.succeed(entry, payload).await?;
            }
            PhaseResult::Skipped { reason } => {
                info!(reason, "security phase skipped");
                self.recorder.succeed(entry, None).await?;
            }
            PhaseResult::Failed(failure) => {
                self.recorder.fail(entry, failure, None).await?;
            }
        }
        Ok(result)
    }

    async fn execute(
        &self,
        deployment_id: convoy_types::DeploymentId,
        job: &DeploymentJob,
        attempt: u32,
    ) -> PhaseResult<SecurityOutput> {
        // Scratch directory unique per attempt; removed when the output
        // (or this frame, on failure) drops.
        let scratch = match TempDir::with_prefix(format!("convoy-{deployment_id}-{attempt}-")) {
            Ok(dir) => dir,
            Err(e) => {
                return PhaseResult::failed(
                    FailureKind::Infrastructure,
                    format!("scratch dir: {e}"),
                    true,
                )
            }
        };

        let clone = match self
            .vcs
            .clone_repo(&job.repository, &job.git_ref, scratch.path())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return vcs_failure(e),
        };
        info!(resolved_sha = %clone.resolved_sha, "repository cloned");

        let mut entries = match std::fs::read_dir(&clone.worktree_path) {
            Ok(entries) => entries,
            Err(e) => {
                return PhaseResult::failed(
                    FailureKind::Infrastructure,
                    format!("worktree unreadable: {e}"),
                    true,
                )
            }
        };
        if entries.next().is_none() {
            return PhaseResult::failed(
                FailureKind::EmptyRepo,
                format!("{} at {} has no content", job.repository, job.git_ref),
                false,
            );
        }

        let report = match self
            .scanner
            .scan_filesystem(
                &clone.worktree_path,
                self.config.policy,
                &self.config.skip_dirs,
                self.config.timeout,
            )
            .await
        {
            Ok(report) => report,
            Err(ScanError::Timeout(d)) => {
                return PhaseResult::failed(
                    FailureKind::Timeout,
                    format!("scanner exceeded {d:?}"),
                    true,
                )
            }
            Err(ScanError::EmptyTarget(path)) => {
                return PhaseResult::failed(
                    FailureKind::EmptyRepo,
                    format!("nothing to scan at {path}"),
                    false,
                )
            }
            Err(ScanError::ScannerFailed(detail)) => {
                return PhaseResult::failed(FailureKind::ScannerError, detail, true)
            }
        };
        if !report.complete {
            return PhaseResult::failed(
                FailureKind::ScannerError,
                "scanner returned partial results",
                true,
            );
        }

        let decision = SecurityDecision::decide(
            report.counts,
            self.config.policy,
            self.config.max_high,
            self.recorder.clock().now(),
        );
        if let Err(e) = self
            .recorder
            .audit()
            .decision(deployment_id, attempt, &decision)
            .await
        {
            return PhaseResult::failed(FailureKind::Infrastructure, e.to_string(), true);
        }
        info!(
            risk_score = decision.risk_score,
            decision = ?decision.decision,
            "scan decided"
        );

        if decision.decision == Verdict::Reject {
            warn!(reasoning = %decision.reasoning, "security policy rejected deployment");
            return PhaseResult::failed(
                FailureKind::SecurityRejected,
                decision.reasoning.clone(),
                false,
            );
        }

        PhaseResult::Ok(SecurityOutput {
            decision,
            resolved_sha: clone.resolved_sha,
            worktree: scratch,
        })
    }
}

fn vcs_failure(error: VcsError) -> PhaseResult<SecurityOutput> {
    let retryable = error.is_retryable();
    let kind = match &error {
        VcsError::Unreachable(_) => FailureKind::Unreachable,
        VcsError::AuthDenied(_) | VcsError::NotFound(_) => FailureKind::Input,
        VcsError::DirtyTarget(_) => FailureKind::Infrastructure,
    };
    let retryable = retryable || matches!(error, VcsError::DirtyTarget(_));
    PhaseResult::failed(kind, error.to_string(), retryable)
}
