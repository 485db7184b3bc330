//! Canary rollout
//!
//! Same start-beside shape as rolling, with weighted-traffic stages in
//! between. Each stage rewrites the reverse-proxy upstream with the
//! production and canary servers weighted to sum exactly 100, holds for
//! the stage duration while sampling both addresses, and aborts the
//! moment the combined error rate exceeds the threshold or the canary
//! develops a failure streak. Aborting restores the saved upstream file
//! byte-for-byte and removes the canary container.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::config::{CanaryConfig, DeployConfig};
use crate::context::RolloutContext;
use crate::deployer::{DeployError, DeployOutcome, DeployRequest, Deployer, Result};
use crate::scripts;
use crate::window::{pre_switch_check, run_confirmation_window};

pub struct CanaryDeployer {
    deploy: DeployConfig,
    canary: CanaryConfig,
}

struct StageVerdict {
    error_rate: f64,
    streak_broken: bool,
}

impl CanaryDeployer {
    pub fn new(deploy: DeployConfig, canary: CanaryConfig) -> Self {
        Self { deploy, canary }
    }

    fn prod_address(req: &DeployRequest) -> String {
        format!("127.0.0.1:{}", req.port)
    }

    fn canary_address(req: &DeployRequest) -> String {
        format!("127.0.0.1:{}", req.side_port())
    }

    /// Upstream body with all traffic on the production server; saved
    /// before the first weighted apply and restored verbatim on abort.
    fn baseline_upstream(req: &DeployRequest) -> String {
        scripts::upstream_content(&[(Self::prod_address(req), 100)])
    }

    /// Weighted servers for a stage. Integer weights sum to 100 exactly;
    /// any slack lands on the production side.
    fn weighted_servers(req: &DeployRequest, canary_weight: u8) -> Vec<(String, u32)> {
        let canary_weight = canary_weight.min(100) as u32;
        vec![
            (Self::prod_address(req), 100 - canary_weight),
            (Self::canary_address(req), canary_weight),
        ]
    }

    /// Hold one stage, sampling both addresses at the configured
    /// cadence.
    async fn hold_stage(
        &self,
        ctx: &RolloutContext,
        req: &DeployRequest,
        duration: std::time::Duration,
    ) -> Result<StageVerdict> {
        let interval = self.canary.probe_interval;
        let ticks = (duration.as_millis() / interval.as_millis().max(1)).max(1) as u32;
        let prod_url = req.health_url(req.port);
        let canary_url = req.health_url(req.side_port());

        let mut failures = 0u32;
        let mut total = 0u32;
        let mut canary_streak = 0u32;

        for tick in 1..=ticks {
            if ctx.cancelled() {
                return Err(DeployError::Cancelled { rolled_back: false });
            }
            // Both addresses sampled per tick, probes in parallel.
            let (prod, canary) = tokio::join!(
                ctx.probe_once(&prod_url, self.deploy.window.probe_timeout, tick),
                ctx.probe_once(&canary_url, self.deploy.window.probe_timeout, tick),
            );
            for sample in [&prod, &canary] {
                total += 1;
                if !sample.healthy {
                    failures += 1;
                }
                ctx.health_sampled(req.attempt, sample).await?;
            }
            canary_streak = if canary.healthy { 0 } else { canary_streak + 1 };
            if self.deploy.window.streak_exhausted(canary_streak) {
                return Ok(StageVerdict {
                    error_rate: failures as f64 / total as f64,
                    streak_broken: true,
                });
            }
            if tick < ticks {
                tokio::select! {
                    _ = ctx.cancel_token().cancelled() => {
                        return Err(DeployError::Cancelled { rolled_back: false });
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        Ok(StageVerdict {
            error_rate: failures as f64 / total as f64,
            streak_broken: false,
        })
    }

    /// Abort mid-stage: restore the saved upstream byte-for-byte, then
    /// remove the canary. The old container never stopped serving.
    async fn abort_stages(
        &self,
        ctx: &RolloutContext,
        req: &DeployRequest,
        reason: String,
        baseline: &str,
    ) -> Result<DeployOutcome> {
        ctx.rollback_started(&reason, req.previous_image_tag.as_deref())
            .await?;

        let restore = format!(
            "set -e\n\
             cat > /etc/nginx/conf.d/convoy-upstream.conf <<'CONVOY_UPSTREAM'\n\
             {baseline}\
             CONVOY_UPSTREAM\n\
             nginx -s reload\n"
        );
        let restored = ctx
            .run_script(
                &req.instance_id,
                "upstream-restore",
                req.attempt,
                &restore,
                self.deploy.script_timeout,
            )
            .await?;
        let cleared = ctx
            .run_script(
                &req.instance_id,
                "stop-candidate",
                req.attempt,
                &scripts::stop_candidate(&req.candidate_name()),
                self.deploy.script_timeout,
            )
            .await?;
        if !restored || !cleared {
            return Err(DeployError::RollbackFailed {
                reason,
                detail: "failed to restore upstream or clear canary".into(),
            });
        }

        if req.previous_image_tag.is_some() {
            Ok(DeployOutcome::FailedAndRolledBack { reason })
        } else {
            Ok(DeployOutcome::FailedNoRollback { reason })
        }
    }

    /// Roll back after promotion: the candidate holds the port, so the
    /// previous image must come back.
    async fn roll_back_promoted(
        &self,
        ctx: &RolloutContext,
        req: &DeployRequest,
        reason: String,
    ) -> Result<DeployOutcome> {
        ctx.rollback_started(&reason, req.previous_image_tag.as_deref())
            .await?;
        let Some(previous) = &req.previous_image_tag else {
            let cleared = ctx
                .run_script(
                    &req.instance_id,
                    "stop-candidate",
                    req.attempt,
                    &scripts::stop_candidate(&req.current_name()),
                    self.deploy.script_timeout,
                )
                .await?;
            if !cleared {
                return Err(DeployError::RollbackFailed {
                    reason,
                    detail: "failed to remove promoted candidate".into(),
                });
            }
            return Ok(DeployOutcome::FailedNoRollback { reason });
        };
        let script = scripts::rollback(
            &req.current_name(),
            &req.candidate_name(),
            previous,
            req.port,
            req.port,
            self.deploy.stop_timeout.as_secs(),
        );
        let restored = ctx
            .run_script(
                &req.instance_id,
                "rollback",
                req.attempt,
                &script,
                self.deploy.script_timeout,
            )
            .await?;
        if !restored {
            return Err(DeployError::RollbackFailed {
                reason,
                detail: format!("rollback script failed restoring {previous}"),
            });
        }
        Ok(DeployOutcome::FailedAndRolledBack { reason })
    }
}

#[async_trait]
impl Deployer for CanaryDeployer {
    #[instrument(skip(self, ctx, req), fields(deployment_id = %req.deployment_id, image_tag = %req.image_tag))]
    async fn deploy(&self, ctx: &RolloutContext, req: &DeployRequest) -> Result<DeployOutcome> {
        let started = ctx.clock().monotonic();
        let schedule: Vec<(u8, u64)> = self
            .canary
            .stages
            .iter()
            .map(|s| (s.weight, s.duration.as_secs()))
            .collect();
        info!(?schedule, threshold = self.canary.error_rate_threshold, "canary schedule");
        ctx.set_payload("stages_completed", 0);

        // Image onto the instance, candidate up on the side port.
        ctx.stage("preparing", Some(format!("pulling {}", req.image_tag)))
            .await?;
        let prepared = ctx
            .run_script(
                &req.instance_id,
                "prep",
                req.attempt,
                &scripts::prep(&req.image_tag),
                self.deploy.script_timeout,
            )
            .await?;
        if !prepared {
            return Ok(DeployOutcome::FailedNoRollback {
                reason: format!("image transfer failed for {}", req.image_tag),
            });
        }

        ctx.stage("starting_new", Some(req.candidate_name())).await?;
        let started_ok = ctx
            .run_script(
                &req.instance_id,
                "start-side",
                req.attempt,
                &scripts::start_side(
                    &req.candidate_name(),
                    &req.image_tag,
                    req.side_port(),
                    req.port,
                    &req.env_vars,
                ),
                self.deploy.script_timeout,
            )
            .await?;
        if !started_ok {
            return Ok(DeployOutcome::FailedNoRollback {
                reason: "canary container failed to start".into(),
            });
        }

        let baseline = Self::baseline_upstream(req);
        let canary_url = req.health_url(req.side_port());
        let reachable = match pre_switch_check(
            ctx,
            &canary_url,
            self.deploy.pre_switch_retries,
            self.deploy.window.probe_timeout,
            req.attempt,
        )
        .await
        {
            Ok(reachable) => reachable,
            Err(DeployError::Cancelled { .. }) => {
                return match self
                    .abort_stages(ctx, req, "cancelled by caller".into(), &baseline)
                    .await
                {
                    Ok(_) => Err(DeployError::Cancelled { rolled_back: true }),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        if !reachable {
            return self
                .abort_stages(ctx, req, "canary never answered its first probe".into(), &baseline)
                .await;
        }

        // Weighted stages.
        for (index, stage) in self.canary.stages.iter().enumerate() {
            if ctx.cancelled() {
                return match self
                    .abort_stages(ctx, req, "cancelled by caller".into(), &baseline)
                    .await
                {
                    Ok(_) => Err(DeployError::Cancelled { rolled_back: true }),
                    Err(e) => Err(e),
                };
            }
            ctx.stage(
                "canary_stage",
                Some(format!("weight {}% for {:?}", stage.weight, stage.duration)),
            )
            .await?;
            let applied = ctx
                .run_script(
                    &req.instance_id,
                    &format!("upstream-{index}"),
                    req.attempt,
                    &scripts::upstream_apply(&Self::weighted_servers(req, stage.weight)),
                    self.deploy.script_timeout,
                )
                .await?;
            if !applied {
                return self
                    .abort_stages(
                        ctx,
                        req,
                        format!("upstream apply failed at stage {index}"),
                        &baseline,
                    )
                    .await;
            }

            let verdict = match self.hold_stage(ctx, req, stage.duration).await {
                Ok(verdict) => verdict,
                Err(DeployError::Cancelled { .. }) => {
                    return match self
                        .abort_stages(ctx, req, "cancelled by caller".into(), &baseline)
                        .await
                    {
                        Ok(_) => Err(DeployError::Cancelled { rolled_back: true }),
                        Err(e) => Err(e),
                    };
                }
                Err(e) => return Err(e),
            };

            // Exclusive on the fail side: exactly the threshold passes.
            if verdict.streak_broken || verdict.error_rate > self.canary.error_rate_threshold {
                warn!(
                    stage = index,
                    error_rate = verdict.error_rate,
                    streak_broken = verdict.streak_broken,
                    "canary stage failed"
                );
                return self
                    .abort_stages(
                        ctx,
                        req,
                        format!(
                            "stage {} failed: error rate {:.3} (threshold {:.3})",
                            index, verdict.error_rate, self.canary.error_rate_threshold
                        ),
                        &baseline,
                    )
                    .await;
            }
            ctx.set_payload("stages_completed", (index + 1) as u64);
            info!(stage = index, weight = stage.weight, "canary stage passed");
        }

        // Promote: the canary takes the application port and the
        // upstream goes back to a single production server.
        ctx.stage("promoting", None).await?;
        let promoted = ctx
            .run_script(
                &req.instance_id,
                "promote",
                req.attempt,
                &scripts::promote(
                    &req.current_name(),
                    &req.candidate_name(),
                    &req.image_tag,
                    req.port,
                    req.port,
                    self.deploy.stop_timeout.as_secs(),
                ),
                self.deploy.script_timeout,
            )
            .await?;
        if !promoted {
            return self
                .roll_back_promoted(ctx, req, "promotion script failed".into())
                .await;
        }
        let upstream_final = ctx
            .run_script(
                &req.instance_id,
                "upstream-final",
                req.attempt,
                &scripts::upstream_apply(&[(Self::prod_address(req), 100)]),
                self.deploy.script_timeout,
            )
            .await?;
        if !upstream_final {
            return self
                .roll_back_promoted(ctx, req, "final upstream apply failed".into())
                .await;
        }

        // Drain on the application port.
        ctx.stage("draining", None).await?;
        let drain = match run_confirmation_window(
            ctx,
            &req.health_url(req.port),
            &self.deploy.window,
            req.attempt,
        )
        .await
        {
            Ok(window) => window,
            Err(DeployError::Cancelled { .. }) => {
                return match self
                    .roll_back_promoted(ctx, req, "cancelled by caller".into())
                    .await
                {
                    Ok(_) => Err(DeployError::Cancelled { rolled_back: true }),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        if !drain.passed {
            return self
                .roll_back_promoted(
                    ctx,
                    req,
                    format!(
                        "post-promotion window failed: {}/{} successes",
                        drain.successes, self.deploy.window.samples
                    ),
                )
                .await;
        }

        let elapsed = started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "canary deploy succeeded");
        Ok(DeployOutcome::Succeeded {
            container_id: req.current_name(),
            elapsed,
        })
    }

    fn name(&self) -> &'static str {
        "canary"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_audit::{AuditGateway, Redactor};
    use convoy_ports::fakes::{FakeExecutor, RecordingSink, ScriptedProber};
    use convoy_ports::{InMemoryStore, SystemClock};
    use convoy_types::{DeploymentId, InstanceId, WindowConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use crate::config::CanaryStage;

    struct Harness {
        executor: Arc<FakeExecutor>,
        prober: Arc<ScriptedProber>,
        sink: Arc<RecordingSink>,
        ctx: RolloutContext,
        req: DeployRequest,
        deployer: CanaryDeployer,
    }

    fn harness(previous: Option<&str>) -> Harness {
        let executor = Arc::new(FakeExecutor::new());
        let prober = Arc::new(ScriptedProber::healthy());
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditGateway::new(store, Arc::new(Redactor::new())));
        let deployment_id = DeploymentId::generate();
        let ctx = RolloutContext::new(
            executor.clone(),
            prober.clone(),
            sink.clone(),
            audit,
            Arc::new(SystemClock),
            CancellationToken::new(),
            deployment_id,
        );
        let req = DeployRequest {
            deployment_id,
            instance_id: InstanceId::parse("i-abc").unwrap(),
            image_tag: "octo-api:deadbeef".into(),
            previous_image_tag: previous.map(String::from),
            port: 8080,
            health_path: "/health".into(),
            env_vars: vec![],
            attempt: 1,
        };
        let deploy = DeployConfig {
            window: WindowConfig {
                interval: Duration::from_millis(1),
                samples: 4,
                min_success: 3,
                max_consecutive_failures: 2,
                probe_timeout: Duration::from_millis(50),
            },
            ..DeployConfig::default()
        };
        // Two tiny stages: 5 ticks each at 1ms cadence.
        let canary = CanaryConfig {
            stages: vec![
                CanaryStage {
                    weight: 10,
                    duration: Duration::from_millis(5),
                },
                CanaryStage {
                    weight: 50,
                    duration: Duration::from_millis(5),
                },
            ],
            error_rate_threshold: 0.05,
            probe_interval: Duration::from_millis(1),
        };
        Harness {
            executor,
            prober,
            sink,
            ctx,
            req,
            deployer: CanaryDeployer::new(deploy, canary),
        }
    }

    #[tokio::test]
    async fn healthy_canary_promotes_through_all_stages() {
        let h = harness(Some("octo-api:cafefeed"));
        let outcome = h.deployer.deploy(&h.ctx, &h.req).await.unwrap();
        assert!(matches!(outcome, DeployOutcome::Succeeded { .. }));

        // Both weighted applies plus the final 100% production upstream.
        assert!(!h.executor.scripts_containing("weight=10;").is_empty());
        assert!(!h.executor.scripts_containing("weight=50;").is_empty());
        assert_eq!(
            h.ctx.take_payload().unwrap()["stages_completed"],
            serde_json::json!(2)
        );
    }

    #[tokio::test]
    async fn failing_stage_restores_upstream_byte_for_byte() {
        let h = harness(Some("octo-api:cafefeed"));
        // Canary answers the pre-switch probe, then degrades hard.
        h.prober.script_for(":8081", vec![Ok(200), Ok(500), Ok(500), Ok(500), Ok(500)]);

        let outcome = h.deployer.deploy(&h.ctx, &h.req).await.unwrap();
        assert!(matches!(outcome, DeployOutcome::FailedAndRolledBack { .. }));

        // The restore script carries exactly the baseline content.
        let baseline = CanaryDeployer::baseline_upstream(&h.req);
        let restores = h.executor.scripts_containing("upstream");
        assert!(
            restores.iter().any(|s| s.contains(&baseline)),
            "saved upstream must be restored verbatim"
        );
        // Candidate removed, promotion never ran.
        assert!(!h.executor.scripts_containing("docker rm -f app-candidate-deadbeef").is_empty());
        assert!(h
            .executor
            .scripts_containing("--env-file /tmp/app-candidate-deadbeef.env -p 8080:8080")
            .is_empty());

        assert_eq!(
            h.ctx.take_payload().unwrap()["stages_completed"],
            serde_json::json!(0)
        );
        assert!(h.sink.kinds().contains(&"rollback_started"));
    }

    #[tokio::test]
    async fn weights_always_sum_to_one_hundred() {
        let req = harness(None).req;
        for weight in [5u8, 10, 25, 50, 75, 100] {
            let servers = CanaryDeployer::weighted_servers(&req, weight);
            let total: u32 = servers.iter().map(|(_, w)| w).sum();
            assert_eq!(total, 100, "weight {weight}");
            // Production side listed first, deterministically.
            assert!(servers[0].0.ends_with(":8080"));
        }
    }

    #[tokio::test]
    async fn exact_threshold_error_rate_passes() {
        // 2 servers x 10 ticks = 20 probes; 1 failure = 5% exactly.
        let h = {
            let mut h = harness(Some("octo-api:cafefeed"));
            h.deployer.canary.stages = vec![CanaryStage {
                weight: 10,
                duration: Duration::from_millis(10),
            }];
            h
        };
        h.prober.script_for(
            ":8081",
            vec![Ok(200), Ok(500), Ok(200), Ok(200), Ok(200), Ok(200), Ok(200), Ok(200), Ok(200), Ok(200), Ok(200)],
        );

        let outcome = h.deployer.deploy(&h.ctx, &h.req).await.unwrap();
        assert!(
            matches!(outcome, DeployOutcome::Succeeded { .. }),
            "exactly 5% must pass: {outcome:?}"
        );
    }
}
