//! Rollout configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use convoy_types::WindowConfig;

/// Deploy-phase tuning shared by both strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// SIGTERM grace when stopping the old container.
    #[serde(with = "convoy_types::duration_millis")]
    pub stop_timeout: Duration,
    /// Confirmation-window parameters.
    pub window: WindowConfig,
    /// Per remote script timeout.
    #[serde(with = "convoy_types::duration_millis")]
    pub script_timeout: Duration,
    /// Pre-switch probe attempts (single probe, retried).
    pub pre_switch_retries: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            window: WindowConfig::default(),
            script_timeout: Duration::from_secs(120),
            pre_switch_retries: 3,
        }
    }
}

/// One canary stage: a traffic weight held for a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryStage {
    /// Percent of traffic sent to the canary.
    pub weight: u8,
    #[serde(with = "convoy_types::duration_millis")]
    pub duration: Duration,
}

/// Canary tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Weighted stages before full promotion.
    pub stages: Vec<CanaryStage>,
    /// A stage fails when `failures / total_probes` exceeds this
    /// (exclusive: exactly the threshold passes).
    pub error_rate_threshold: f64,
    /// Probe cadence while a stage is held.
    #[serde(with = "convoy_types::duration_millis")]
    pub probe_interval: Duration,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                CanaryStage {
                    weight: 10,
                    duration: Duration::from_secs(300),
                },
                CanaryStage {
                    weight: 50,
                    duration: Duration::from_secs(300),
                },
            ],
            error_rate_threshold: 0.05,
            probe_interval: Duration::from_secs(10),
        }
    }
}

/// Weights a canary stage may legally request.
pub const ALLOWED_WEIGHTS: [u8; 6] = [5, 10, 25, 50, 75, 100];

/// Stage duration bounds.
pub const MIN_STAGE_DURATION: Duration = Duration::from_secs(60);
pub const MAX_STAGE_DURATION: Duration = Duration::from_secs(30 * 60);

impl CanaryStage {
    /// Clamp into the legal schedule: weight snaps to the nearest
    /// allowed value, duration clamps into bounds.
    pub fn clamped(self) -> Self {
        let weight = *ALLOWED_WEIGHTS
            .iter()
            .min_by_key(|w| (**w as i16 - self.weight as i16).unsigned_abs())
            .expect("allowed weights is non-empty");
        Self {
            weight,
            duration: self.duration.clamp(MIN_STAGE_DURATION, MAX_STAGE_DURATION),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_clamp_to_legal_schedule() {
        let stage = CanaryStage {
            weight: 12,
            duration: Duration::from_secs(10),
        };
        let clamped = stage.clamped();
        assert_eq!(clamped.weight, 10);
        assert_eq!(clamped.duration, MIN_STAGE_DURATION);

        let stage = CanaryStage {
            weight: 99,
            duration: Duration::from_secs(7200),
        };
        let clamped = stage.clamped();
        assert_eq!(clamped.weight, 100);
        assert_eq!(clamped.duration, MAX_STAGE_DURATION);
    }
}
