//! Workflow coordinator
//!
//! One deployment at a time: Pending → Scanning → Building → Deploying
//! → Verifying → a terminal status. The coordinator is the sole writer
//! of the deployment record, enforces phase deadlines, propagates
//! cancellation and lock loss, and guarantees the terminal
//! `StatusChanged` event is the last thing a deployment ever publishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use convoy_audit::AuditGateway;
use convoy_phases::{
    BuildPhase, DeployPhase, PhaseFailure, PhaseRecorder, PhaseResult, SecurityPhase,
};
use convoy_ports::{Clock, EventSink, RemoteExecutor};
use convoy_rollout::{run_confirmation_window, DeployOutcome, RolloutContext, scripts};
use convoy_types::{
    CommandId, DeploymentId, DeploymentJob, DeploymentRecord, DeploymentStatus, EventPayload,
    FailureKind, Phase, PhaseRecord, WindowConfig,
};

use crate::config::PhaseTimeouts;
use crate::error::Result;

/// What the worker should do with the job after a run.
#[derive(Debug)]
pub enum RunDisposition {
    /// The deployment reached a terminal status; ack the job.
    Terminal(DeploymentStatus),
    /// A retryable failure; nack the job so the queue redelivers it.
    Retry(PhaseFailure),
}

pub struct Coordinator {
    security: SecurityPhase,
    build: BuildPhase,
    deploy: DeployPhase,
    recorder: Arc<PhaseRecorder>,
    audit: Arc<AuditGateway>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn convoy_ports::HealthProber>,
    verify_window: WindowConfig,
    timeouts: PhaseTimeouts,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        security: SecurityPhase,
        build: BuildPhase,
        deploy: DeployPhase,
        recorder: Arc<PhaseRecorder>,
        events: Arc<dyn EventSink>,
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn convoy_ports::HealthProber>,
        verify_window: WindowConfig,
        timeouts: PhaseTimeouts,
    ) -> Self {
        let audit = recorder.audit().clone();
        let clock = recorder.clock().clone();
        Self {
            security,
            build,
            deploy,
            recorder,
            audit,
            events,
            clock,
            executor,
            prober,
            verify_window,
            timeouts,
        }
    }

    /// Drive one job to a disposition. `external_cancel` is the
    /// caller's cancel signal; `lock_lost` fires when the instance
    /// lease cannot be renewed.
    #[instrument(skip_all, fields(deployment_id = %deployment_id))]
    pub async fn run(
        &self,
        deployment_id: DeploymentId,
        job: &DeploymentJob,
        external_cancel: CancellationToken,
        lock_lost: CancellationToken,
    ) -> Result<RunDisposition> {
        // Redeliveries of finished work ack immediately.
        if let Some(existing) = self.audit.store().get_record(deployment_id).await? {
            if existing.status.is_terminal() {
                info!(status = %existing.status, "deployment already terminal, acking redelivery");
                return Ok(RunDisposition::Terminal(existing.status));
            }
        }

        for secret in job.env_vars.iter().filter(|v| v.secret) {
            self.audit.redactor().register_secret(secret.value.clone());
        }

        let mut record = DeploymentRecord::new(
            deployment_id,
            job.job_id,
            job.instance_id.clone(),
            job.environment,
            job.strategy,
            self.clock.now(),
        );
        self.audit.record(&record).await?;
        self.status_changed(&record, None).await?;

        let attempt = job.retry_count + 1;
        let merged = CancellationToken::new();
        let watcher = {
            let merged = merged.clone();
            let external = external_cancel.clone();
            let lost = lock_lost.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => merged.cancel(),
                    _ = lost.cancelled() => merged.cancel(),
                }
            })
        };

        let disposition = self
            .drive(&mut record, job, attempt, &merged, &external_cancel, &lock_lost)
            .await;
        watcher.abort();
        disposition
    }

    /// The phase sequence proper. Every exit path funnels through
    /// `finish` so the terminal bookkeeping happens exactly once.
    async fn drive(
        &self,
        record: &mut DeploymentRecord,
        job: &DeploymentJob,
        attempt: u32,
        merged: &CancellationToken,
        external_cancel: &CancellationToken,
        lock_lost: &CancellationToken,
    ) -> Result<RunDisposition> {
        let deployment_id = record.deployment_id;

        // ---- Scanning ----
        let phase_start = self.clock.monotonic();
        let security = match self
            .phase_with_deadline(
                deployment_id,
                Phase::Security,
                attempt,
                self.timeouts.security,
                merged,
                self.security.run(deployment_id, job, attempt),
            )
            .await?
        {
            PhaseOutcome::Done(result) => result,
            PhaseOutcome::Interrupted => {
                return self
                    .interrupted(record, Phase::Security, attempt, external_cancel, lock_lost)
                    .await;
            }
        };
        record
            .phase_durations
            .insert(Phase::Security, phase_start.elapsed());

        let security_output = match security {
            PhaseResult::Ok(output) => output,
            PhaseResult::Skipped { .. } => {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Failed,
                        Some((FailureKind::Infrastructure, "security phase skipped".into())),
                    )
                    .await;
            }
            PhaseResult::Failed(failure) => {
                if failure.kind == FailureKind::SecurityRejected {
                    return self
                        .finish(
                            record,
                            DeploymentStatus::Rejected,
                            Some((failure.kind, failure.detail)),
                        )
                        .await;
                }
                return self.fail_or_retry(record, failure).await;
            }
        };

        // ---- Building ----
        record.status = DeploymentStatus::Building;
        self.audit.record(record).await?;
        self.status_changed(record, None).await?;

        let phase_start = self.clock.monotonic();
        let build = match self
            .phase_with_deadline(
                deployment_id,
                Phase::Build,
                attempt,
                self.timeouts.build,
                merged,
                self.build.run(
                    deployment_id,
                    job,
                    security_output.worktree.path(),
                    &security_output.resolved_sha,
                    attempt,
                ),
            )
            .await?
        {
            PhaseOutcome::Done(result) => result,
            PhaseOutcome::Interrupted => {
                return self
                    .interrupted(record, Phase::Build, attempt, external_cancel, lock_lost)
                    .await;
            }
        };
        record
            .phase_durations
            .insert(Phase::Build, phase_start.elapsed());
        // The worktree is no longer needed whatever happened.
        drop(security_output.worktree);

        let artifact = match build {
            PhaseResult::Ok(artifact) => artifact,
            PhaseResult::Skipped { .. } => {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Failed,
                        Some((FailureKind::BuildFailed, "build phase skipped".into())),
                    )
                    .await;
            }
            PhaseResult::Failed(failure) => return self.fail_or_retry(record, failure).await,
        };

        // ---- Deploying ----
        // The previous image tag is persisted before anything on the
        // instance can change, so rollback always knows where to go.
        let previous_image_tag = self
            .audit
            .store()
            .latest_deployed_for_instance(&job.instance_id)
            .await?
            .and_then(|r| r.current_image_tag);
        record.status = DeploymentStatus::Deploying;
        record.previous_image_tag = previous_image_tag.clone();
        record.current_image_tag = Some(artifact.image_tag.clone());
        self.audit.record(record).await?;
        self.status_changed(record, None).await?;

        let phase_start = self.clock.monotonic();
        let deploy_cancel = merged.child_token();
        // The deploy phase observes the token at its own checkpoints and
        // rolls back before returning; it only gets hard-interrupted if
        // it overruns the cancel grace period.
        let deploy_interrupt = CancellationToken::new();
        let grace_task = {
            let merged = merged.clone();
            let interrupt = deploy_interrupt.clone();
            let grace = self.timeouts.cancel_grace;
            tokio::spawn(async move {
                merged.cancelled().await;
                tokio::time::sleep(grace).await;
                interrupt.cancel();
            })
        };
        let deploy = match self
            .phase_with_deadline(
                deployment_id,
                Phase::Deploy,
                attempt,
                self.timeouts.deploy,
                &deploy_interrupt,
                self.deploy.run(
                    deployment_id,
                    job,
                    &artifact.image_tag,
                    previous_image_tag.clone(),
                    attempt,
                    deploy_cancel,
                ),
            )
            .await?
        {
            PhaseOutcome::Done(result) => {
                grace_task.abort();
                result
            }
            PhaseOutcome::Interrupted => {
                grace_task.abort();
                return self
                    .interrupted(record, Phase::Deploy, attempt, external_cancel, lock_lost)
                    .await;
            }
        };
        record
            .phase_durations
            .insert(Phase::Deploy, phase_start.elapsed());

        let outcome = match deploy {
            PhaseResult::Ok(outcome) => outcome,
            PhaseResult::Skipped { .. } => {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Failed,
                        Some((FailureKind::Infrastructure, "deploy phase skipped".into())),
                    )
                    .await;
            }
            PhaseResult::Failed(failure) => {
                if failure.kind == FailureKind::Cancelled {
                    if lock_lost.is_cancelled() {
                        return self
                            .finish(
                                record,
                                DeploymentStatus::Failed,
                                Some((FailureKind::LockLost, "instance lease lost".into())),
                            )
                            .await;
                    }
                    return self
                        .finish(
                            record,
                            DeploymentStatus::Cancelled,
                            Some((failure.kind, failure.detail)),
                        )
                        .await;
                }
                return self.fail_or_retry(record, failure).await;
            }
        };

        match outcome {
            DeployOutcome::Succeeded { .. } => {}
            DeployOutcome::FailedAndRolledBack { reason } => {
                record.rollback_reason = Some(reason.clone());
                return self
                    .finish(
                        record,
                        DeploymentStatus::RolledBack,
                        Some((FailureKind::HealthFailed, reason)),
                    )
                    .await;
            }
            DeployOutcome::FailedNoRollback { reason } => {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Failed,
                        Some((FailureKind::HealthFailed, reason)),
                    )
                    .await;
            }
        }

        // ---- Verifying ----
        record.status = DeploymentStatus::Verifying;
        self.audit.record(record).await?;
        self.status_changed(record, None).await?;

        let verified = self
            .verify(deployment_id, job, &artifact.image_tag, previous_image_tag.as_deref(), attempt, merged)
            .await?;
        if let Some(failure) = verified {
            if merged.is_cancelled() && lock_lost.is_cancelled() {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Failed,
                        Some((FailureKind::LockLost, "instance lease lost".into())),
                    )
                    .await;
            }
            if merged.is_cancelled() {
                return self
                    .finish(
                        record,
                        DeploymentStatus::Cancelled,
                        Some((FailureKind::Cancelled, failure.detail)),
                    )
                    .await;
            }
            return self
                .finish(
                    record,
                    DeploymentStatus::Failed,
                    Some((failure.kind, failure.detail)),
                )
                .await;
        }

        self.finish(record, DeploymentStatus::Deployed, None).await
    }

    /// Post-deploy confirmation on the application port, recorded as
    /// the verify phase. On failure the previous image is restored
    /// before the deployment fails.
    async fn verify(
        &self,
        deployment_id: DeploymentId,
        job: &DeploymentJob,
        image_tag: &str,
        previous_image_tag: Option<&str>,
        attempt: u32,
        merged: &CancellationToken,
    ) -> Result<Option<PhaseFailure>> {
        let entry = self
            .recorder
            .enter(deployment_id, Phase::Verify, attempt)
            .await?;

        let ctx = RolloutContext::new(
            self.executor.clone(),
            self.prober.clone(),
            self.events.clone(),
            self.audit.clone(),
            self.clock.clone(),
            merged.child_token(),
            deployment_id,
        );
        let url = format!("http://{}:{}{}", job.instance_id, job.port, job.health_path);
        let window = match run_confirmation_window(&ctx, &url, &self.verify_window, attempt).await {
            Ok(window) => window,
            Err(_cancelled) => {
                let failure =
                    PhaseFailure::new(FailureKind::Cancelled, "cancelled during verify", false);
                self.recorder.fail(entry, &failure, None).await?;
                return Ok(Some(failure));
            }
        };

        if window.passed {
            let payload = serde_json::json!({
                "successes": window.successes,
                "failures": window.failures,
            });
            self.recorder.succeed(entry, Some(payload)).await?;
            return Ok(None);
        }

        // A regression this late is remediated the same way the
        // cancellation branch would: restore the previous image, then
        // fail the deployment.
        warn!(
            successes = window.successes,
            "post-deploy confirmation failed"
        );
        let reason = format!(
            "post-deploy confirmation failed: {}/{} successes",
            window.successes, self.verify_window.samples
        );
        self.events
            .publish(
                deployment_id,
                EventPayload::RollbackStarted {
                    reason: reason.clone(),
                    previous_image_tag: previous_image_tag.map(String::from),
                },
            )
            .await
            .map_err(convoy_audit::AuditError::Store)?;
        if let Some(previous) = previous_image_tag {
            let script = scripts::rollback(
                &format!("app-{}", job.port),
                &candidate_name(image_tag),
                previous,
                job.port,
                job.port,
                30,
            );
            let command_id = CommandId::derive(deployment_id, Phase::Verify, "rollback", attempt);
            let _ = self
                .executor
                .run(&job.instance_id, &command_id, &script, Duration::from_secs(120))
                .await;
        }

        let failure = PhaseFailure::new(FailureKind::HealthFailed, reason, false);
        self.recorder.fail(entry, &failure, None).await?;
        Ok(Some(failure))
    }

    /// Run a phase future against its deadline and the merged cancel
    /// token. A deadline hit writes the failed exit row here, since the
    /// phase future was dropped before it could.
    async fn phase_with_deadline<T>(
        &self,
        deployment_id: DeploymentId,
        phase: Phase,
        attempt: u32,
        deadline: Duration,
        interrupt: &CancellationToken,
        fut: impl Future<Output = std::result::Result<PhaseResult<T>, convoy_audit::AuditError>>,
    ) -> Result<PhaseOutcome<T>> {
        tokio::select! {
            _ = interrupt.cancelled() => Ok(PhaseOutcome::Interrupted),
            result = tokio::time::timeout(deadline, fut) => match result {
                Ok(inner) => Ok(PhaseOutcome::Done(inner?)),
                Err(_elapsed) => {
                    let failure = PhaseFailure::new(
                        FailureKind::Timeout,
                        format!("{phase} exceeded {deadline:?}"),
                        true,
                    );
                    let row = PhaseRecord::started(deployment_id, phase, attempt, self.clock.now());
                    self.recorder.fail(row, &failure, None).await?;
                    Ok(PhaseOutcome::Done(PhaseResult::Failed(failure)))
                }
            }
        }
    }

    /// A security or build phase interrupted by cancel or lock loss.
    /// Nothing on the instance has changed yet, so no rollback.
    async fn interrupted(
        &self,
        record: &mut DeploymentRecord,
        phase: Phase,
        attempt: u32,
        external_cancel: &CancellationToken,
        lock_lost: &CancellationToken,
    ) -> Result<RunDisposition> {
        let (status, kind, detail) = if lock_lost.is_cancelled() {
            (
                DeploymentStatus::Failed,
                FailureKind::LockLost,
                "instance lease lost".to_string(),
            )
        } else if external_cancel.is_cancelled() {
            (
                DeploymentStatus::Cancelled,
                FailureKind::Cancelled,
                format!("cancelled during {phase}"),
            )
        } else {
            (
                DeploymentStatus::Failed,
                FailureKind::Infrastructure,
                format!("{phase} interrupted"),
            )
        };
        let failure = PhaseFailure::new(kind, detail.clone(), false);
        let row = PhaseRecord::started(record.deployment_id, phase, attempt, self.clock.now());
        self.recorder.fail(row, &failure, None).await?;
        self.finish(record, status, Some((kind, detail))).await
    }

    /// Map a phase failure to a retry or a terminal `Failed`.
    async fn fail_or_retry(
        &self,
        record: &mut DeploymentRecord,
        failure: PhaseFailure,
    ) -> Result<RunDisposition> {
        if failure.retryable {
            info!(kind = %failure.kind, detail = %failure.detail, "phase failed, retrying via queue");
            // Leave the record non-terminal; the redelivered job resumes
            // with a fresh attempt index.
            return Ok(RunDisposition::Retry(failure));
        }
        self.finish(
            record,
            DeploymentStatus::Failed,
            Some((failure.kind, failure.detail)),
        )
        .await
    }

    /// Terminal bookkeeping: flush, write the immutable record, then
    /// emit the terminal `StatusChanged` as the very last action.
    async fn finish(
        &self,
        record: &mut DeploymentRecord,
        status: DeploymentStatus,
        failure: Option<(FailureKind, String)>,
    ) -> Result<RunDisposition> {
        record.status = status;
        record.completed_at = Some(self.clock.now());
        record.failure_reason = failure.clone();
        self.audit.record_terminal(record).await?;
        self.status_changed(record, failure.map(|(_, detail)| detail))
            .await?;
        info!(status = %status, "deployment finished");
        Ok(RunDisposition::Terminal(status))
    }

    /// Called by the worker when the queue drops a job whose retry
    /// budget ran out; the record must still reach a terminal status.
    pub async fn finalize_exhausted(
        &self,
        deployment_id: DeploymentId,
        failure: &PhaseFailure,
    ) -> Result<()> {
        let Some(mut record) = self.audit.store().get_record(deployment_id).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }
        record.status = DeploymentStatus::Failed;
        record.completed_at = Some(self.clock.now());
        record.failure_reason = Some((
            failure.kind,
            format!("{} (retry budget exhausted)", failure.detail),
        ));
        self.audit.record_terminal(&record).await?;
        self.status_changed(&record, Some("retry budget exhausted".into()))
            .await?;
        Ok(())
    }

    async fn status_changed(
        &self,
        record: &DeploymentRecord,
        reason: Option<String>,
    ) -> Result<()> {
        self.events
            .publish(
                record.deployment_id,
                EventPayload::StatusChanged {
                    status: record.status,
                    reason,
                },
            )
            .await
            .map_err(convoy_audit::AuditError::Store)?;
        Ok(())
    }
}

enum PhaseOutcome<T> {
    Done(PhaseResult<T>),
    Interrupted,
}

fn candidate_name(image_tag: &str) -> String {
    let version = image_tag.split(':').nth(1).unwrap_or("unknown");
    format!("app-candidate-{}", &version[..version.len().min(8)])
}
