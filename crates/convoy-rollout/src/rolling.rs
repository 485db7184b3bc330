//! Rolling rollout
//!
//! Start the candidate beside the old container, confirm its health on
//! the side port, promote it into place, and confirm again on the
//! application port. Any failure after the candidate starts rolls back
//! to the previous image when one exists.

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::config::DeployConfig;
use crate::context::RolloutContext;
use crate::deployer::{DeployError, DeployOutcome, DeployRequest, Deployer, Result};
use crate::scripts;
use crate::window::{pre_switch_check, run_confirmation_window};

pub struct RollingDeployer {
    config: DeployConfig,
}

impl RollingDeployer {
    pub fn new(config: DeployConfig) -> Self {
        Self { config }
    }

    /// Roll back after a post-start failure. Emits `RollbackStarted`
    /// before any remediation, restores the previous image when there is
    /// one, and otherwise just clears the candidate.
    async fn roll_back(
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
                    &scripts::stop_candidate(&req.candidate_name()),
                    self.config.script_timeout,
                )
                .await?;
            if !cleared {
                return Err(DeployError::RollbackFailed {
                    reason,
                    detail: "failed to remove candidate container".into(),
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
            self.config.stop_timeout.as_secs(),
        );
        let restored = ctx
            .run_script(
                &req.instance_id,
                "rollback",
                req.attempt,
                &script,
                self.config.script_timeout,
            )
            .await?;
        if !restored {
            return Err(DeployError::RollbackFailed {
                reason,
                detail: format!("rollback script failed restoring {previous}"),
            });
        }
        info!(previous_image_tag = %previous, "previous image restored");
        Ok(DeployOutcome::FailedAndRolledBack { reason })
    }

    /// Cancellation observed mid-rollout: remediate if the candidate is
    /// already running, then surface the cancel.
    async fn cancelled(
        &self,
        ctx: &RolloutContext,
        req: &DeployRequest,
        past_start: bool,
    ) -> DeployError {
        if !past_start {
            return DeployError::Cancelled {
                rolled_back: false,
            };
        }
        match self.roll_back(ctx, req, "cancelled by caller".into()).await {
            Ok(_) => DeployError::Cancelled { rolled_back: true },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Deployer for RollingDeployer {
    #[instrument(skip(self, ctx, req), fields(deployment_id = %req.deployment_id, image_tag = %req.image_tag))]
    async fn deploy(&self, ctx: &RolloutContext, req: &DeployRequest) -> Result<DeployOutcome> {
        let started = ctx.clock().monotonic();

        // Preparing: get the image onto the instance.
        ctx.stage("preparing", Some(format!("pulling {}", req.image_tag)))
            .await?;
        let prepared = ctx
            .run_script(
                &req.instance_id,
                "prep",
                req.attempt,
                &scripts::prep(&req.image_tag),
                self.config.script_timeout,
            )
            .await?;
        if !prepared {
            return Ok(DeployOutcome::FailedNoRollback {
                reason: format!("image transfer failed for {}", req.image_tag),
            });
        }

        // StartingNew: candidate on the side port.
        ctx.stage("starting_new", Some(req.candidate_name())).await?;
        let start_script = scripts::start_side(
            &req.candidate_name(),
            &req.image_tag,
            req.side_port(),
            req.port,
            &req.env_vars,
        );
        let candidate_up = ctx
            .run_script(
                &req.instance_id,
                "start-side",
                req.attempt,
                &start_script,
                self.config.script_timeout,
            )
            .await?;
        if !candidate_up {
            return Ok(DeployOutcome::FailedNoRollback {
                reason: "candidate container failed to start".into(),
            });
        }
        if ctx.cancelled() {
            return Err(self.cancelled(ctx, req, true).await);
        }

        // Pre-switch sanity probe, then the side-port window.
        ctx.stage("health_checking", None).await?;
        let side_url = req.health_url(req.side_port());
        let reachable = match pre_switch_check(
            ctx,
            &side_url,
            self.config.pre_switch_retries,
            self.config.window.probe_timeout,
            req.attempt,
        )
        .await
        {
            Ok(reachable) => reachable,
            Err(DeployError::Cancelled { .. }) => return Err(self.cancelled(ctx, req, true).await),
            Err(e) => return Err(e),
        };
        if !reachable {
            return self
                .roll_back(ctx, req, "candidate never answered its first probe".into())
                .await;
        }
        let side_window =
            match run_confirmation_window(ctx, &side_url, &self.config.window, req.attempt).await {
                Ok(window) => window,
                Err(DeployError::Cancelled { .. }) => {
                    return Err(self.cancelled(ctx, req, true).await)
                }
                Err(e) => return Err(e),
            };
        if !side_window.passed {
            return self
                .roll_back(
                    ctx,
                    req,
                    format!(
                        "side-port window failed: {}/{} successes, streak {}",
                        side_window.successes,
                        self.config.window.samples,
                        side_window.longest_failure_streak
                    ),
                )
                .await;
        }
        if ctx.cancelled() {
            return Err(self.cancelled(ctx, req, true).await);
        }

        // Promoting: the candidate takes the application port. The
        // previous image tag was persisted before this strategy ran.
        ctx.stage("promoting", None).await?;
        let promote_script = scripts::promote(
            &req.current_name(),
            &req.candidate_name(),
            &req.image_tag,
            req.port,
            req.port,
            self.config.stop_timeout.as_secs(),
        );
        let promoted = ctx
            .run_script(
                &req.instance_id,
                "promote",
                req.attempt,
                &promote_script,
                self.config.script_timeout,
            )
            .await?;
        if !promoted {
            return self
                .roll_back(ctx, req, "promotion script failed".into())
                .await;
        }

        // Draining: confirm on the application port.
        ctx.stage("draining", None).await?;
        let drain_url = req.health_url(req.port);
        let drain_window =
            match run_confirmation_window(ctx, &drain_url, &self.config.window, req.attempt).await {
                Ok(window) => window,
                Err(DeployError::Cancelled { .. }) => {
                    return Err(self.cancelled(ctx, req, true).await)
                }
                Err(e) => return Err(e),
            };
        if !drain_window.passed {
            return self
                .roll_back(
                    ctx,
                    req,
                    format!(
                        "post-promotion window failed: {}/{} successes, streak {}",
                        drain_window.successes,
                        self.config.window.samples,
                        drain_window.longest_failure_streak
                    ),
                )
                .await;
        }

        let elapsed = started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "rolling deploy succeeded");
        Ok(DeployOutcome::Succeeded {
            container_id: req.current_name(),
            elapsed,
        })
    }

    fn name(&self) -> &'static str {
        "rolling"
    }
}
