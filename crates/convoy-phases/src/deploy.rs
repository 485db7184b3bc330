//! Deploy phase
//!
//! Thin dispatcher: pick the deployer for the job's strategy, hand it
//! the artifact and the previously-deployed tag, and translate its
//! verdict into phase bookkeeping. Rollback decisions belong to the
//! strategies; this phase only records what they did.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use convoy_rollout::{
    create_deployer, CanaryConfig, DeployConfig, DeployError, DeployOutcome, DeployRequest,
    RolloutContext,
};
use convoy_ports::{HealthProber, RemoteExecutor};
use convoy_types::{DeploymentId, DeploymentJob, FailureKind, Phase};

use crate::recorder::PhaseRecorder;
use crate::result::{PhaseFailure, PhaseResult};

pub struct DeployPhase {
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HealthProber>,
    recorder: Arc<PhaseRecorder>,
    deploy_config: DeployConfig,
    canary_config: CanaryConfig,
}

impl DeployPhase {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn HealthProber>,
        recorder: Arc<PhaseRecorder>,
        deploy_config: DeployConfig,
        canary_config: CanaryConfig,
    ) -> Self {
        Self {
            executor,
            prober,
            recorder,
            deploy_config,
            canary_config,
        }
    }

    #[instrument(skip_all, fields(deployment_id = %deployment_id, strategy = %job.strategy))]
    pub async fn run(
        &self,
        deployment_id: DeploymentId,
        job: &DeploymentJob,
        image_tag: &str,
        previous_image_tag: Option<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Result<PhaseResult<DeployOutcome>, convoy_audit::AuditError> {
        let entry = self
            .recorder
            .enter(deployment_id, Phase::Deploy, attempt)
            .await?;

        let req = DeployRequest {
            deployment_id,
            instance_id: job.instance_id.clone(),
            image_tag: image_tag.to_string(),
            previous_image_tag,
            port: job.port,
            health_path: job.health_path.clone(),
            env_vars: job.env_vars.clone(),
            attempt,
        };
        let ctx = RolloutContext::new(
            self.executor.clone(),
            self.prober.clone(),
            self.recorder.events().clone(),
            self.recorder.audit().clone(),
            self.recorder.clock().clone(),
            cancel,
            deployment_id,
        );
        let deployer = create_deployer(
            job.strategy,
            self.deploy_config.clone(),
            self.canary_config.clone(),
        );
        info!(deployer = deployer.name(), "dispatching rollout");

        let verdict = deployer.deploy(&ctx, &req).await;
        let payload = ctx.take_payload();

        let result = match verdict {
            Ok(outcome @ DeployOutcome::Succeeded { .. }) => {
                self.recorder.succeed(entry, payload).await?;
                PhaseResult::Ok(outcome)
            }
            Ok(outcome) => {
                let reason = match &outcome {
                    DeployOutcome::FailedAndRolledBack { reason }
                    | DeployOutcome::FailedNoRollback { reason } => reason.clone(),
                    DeployOutcome::Succeeded { .. } => unreachable!(),
                };
                // The strategy already remediated; the phase row records
                // the health verdict, the coordinator picks the status.
                let failure = PhaseFailure::new(FailureKind::HealthFailed, reason, false);
                self.recorder.fail(entry, &failure, payload).await?;
                PhaseResult::Ok(outcome)
            }
            Err(error) => {
                let failure = deploy_failure(&error);
                self.recorder.fail(entry, &failure, payload).await?;
                PhaseResult::Failed(failure)
            }
        };
        Ok(result)
    }
}

fn deploy_failure(error: &DeployError) -> PhaseFailure {
    match error {
        DeployError::Unreachable(detail) => {
            PhaseFailure::new(FailureKind::Unreachable, detail.clone(), true)
        }
        DeployError::RollbackFailed { reason, detail } => PhaseFailure::new(
            FailureKind::Infrastructure,
            format!("{reason}; rollback also failed: {detail}"),
            false,
        ),
        DeployError::EventStream(detail) => {
            PhaseFailure::new(FailureKind::Infrastructure, detail.clone(), true)
        }
        DeployError::Cancelled { rolled_back } => PhaseFailure::new(
            FailureKind::Cancelled,
            if *rolled_back {
                "cancelled; previous image restored"
            } else {
                "cancelled before any change"
            },
            false,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_audit::{AuditGateway, Redactor};
    use convoy_ports::fakes::{FakeExecutor, RecordingSink, ScriptedProber};
    use convoy_ports::{InMemoryStore, Store, SystemClock};
    use convoy_types::{
        Environment, InstanceId, JobId, PhaseStatus, Strategy, TriggeredBy, WindowConfig,
    };
    use std::time::Duration;

    fn job(strategy: Strategy) -> DeploymentJob {
        DeploymentJob {
            job_id: JobId::generate(),
            deployment_id: None,
            repository: "octo/api".into(),
            git_ref: "main".into(),
            commit_sha: None,
            instance_id: InstanceId::parse("i-abc").unwrap(),
            environment: Environment::Production,
            strategy,
            port: 8080,
            health_path: "/health".into(),
            env_vars: vec![],
            priority: 0,
            submitted_at: Utc::now(),
            triggered_by: TriggeredBy::Cli,
            retry_count: 0,
        }
    }

    fn phase(prober: Arc<ScriptedProber>) -> (Arc<InMemoryStore>, DeployPhase) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditGateway::new(store.clone(), Arc::new(Redactor::new())));
        let recorder = Arc::new(PhaseRecorder::new(
            audit,
            Arc::new(RecordingSink::new()),
            Arc::new(SystemClock),
        ));
        let deploy_config = DeployConfig {
            window: WindowConfig {
                interval: Duration::from_millis(1),
                samples: 4,
                min_success: 3,
                max_consecutive_failures: 2,
                probe_timeout: Duration::from_millis(50),
            },
            ..DeployConfig::default()
        };
        let phase = DeployPhase::new(
            Arc::new(FakeExecutor::new()),
            prober,
            recorder,
            deploy_config,
            CanaryConfig::default(),
        );
        (store, phase)
    }

    #[tokio::test]
    async fn successful_rollout_records_a_succeeded_phase() {
        let (store, phase) = phase(Arc::new(ScriptedProber::healthy()));
        let id = DeploymentId::generate();
        let result = phase
            .run(
                id,
                &job(Strategy::Rolling),
                "octo-api:deadbeef",
                None,
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(
            result,
            PhaseResult::Ok(DeployOutcome::Succeeded { .. })
        ));
        let rows = store.list_phases(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PhaseStatus::Succeeded);
    }

    #[tokio::test]
    async fn health_failure_records_the_kind() {
        let prober = Arc::new(ScriptedProber::healthy());
        prober.script_for(":8081", vec![Ok(500); 12]);
        let (store, phase) = phase(prober);
        let id = DeploymentId::generate();
        let result = phase
            .run(
                id,
                &job(Strategy::Rolling),
                "octo-api:deadbeef",
                Some("octo-api:cafefeed".into()),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(
            result,
            PhaseResult::Ok(DeployOutcome::FailedAndRolledBack { .. })
        ));
        let rows = store.list_phases(id).await.unwrap();
        assert_eq!(rows[0].status, PhaseStatus::Failed);
        assert_eq!(rows[0].failure.as_ref().unwrap().0, FailureKind::HealthFailed);
    }
}
