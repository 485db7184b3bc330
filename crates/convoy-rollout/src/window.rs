//! Confirmation-window runner

use std::time::Duration;
use tracing::{debug, info};

use convoy_types::{HealthSample, WindowConfig, WindowOutcome};

use crate::context::RolloutContext;
use crate::deployer::{DeployError, Result};

/// Run one confirmation window against `url`.
///
/// Probes on the configured cadence, emits and persists every sample,
/// and stops early once a failure streak has already doomed the window.
/// Cancellation aborts between ticks.
pub async fn run_confirmation_window(
    ctx: &RolloutContext,
    url: &str,
    cfg: &WindowConfig,
    phase_attempt: u32,
) -> Result<WindowOutcome> {
    let mut samples: Vec<HealthSample> = Vec::with_capacity(cfg.samples as usize);
    let mut streak = 0u32;

    for tick in 1..=cfg.samples {
        if ctx.cancelled() {
            return Err(DeployError::Cancelled { rolled_back: false });
        }

        let sample = ctx.probe_once(url, cfg.probe_timeout, tick).await;
        streak = if sample.healthy { 0 } else { streak + 1 };
        ctx.health_sampled(phase_attempt, &sample).await?;
        samples.push(sample);

        if cfg.streak_exhausted(streak) {
            debug!(url, streak, "failure streak exhausted the window early");
            break;
        }
        if tick < cfg.samples {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    return Err(DeployError::Cancelled { rolled_back: false });
                }
                _ = tokio::time::sleep(cfg.interval) => {}
            }
        }
    }

    let outcome = cfg.evaluate(&samples);
    info!(
        url,
        passed = outcome.passed,
        successes = outcome.successes,
        failures = outcome.failures,
        "confirmation window evaluated"
    );
    Ok(outcome)
}

/// Single pre-switch probe with retries: passes on the first success.
pub async fn pre_switch_check(
    ctx: &RolloutContext,
    url: &str,
    retries: u32,
    timeout: Duration,
    phase_attempt: u32,
) -> Result<bool> {
    for attempt in 1..=retries.max(1) {
        if ctx.cancelled() {
            return Err(DeployError::Cancelled { rolled_back: false });
        }
        let sample = ctx.probe_once(url, timeout, attempt).await;
        ctx.health_sampled(phase_attempt, &sample).await?;
        if sample.healthy {
            return Ok(true);
        }
    }
    Ok(false)
}
