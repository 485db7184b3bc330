//! Engine configuration
//!
//! One struct covering the recognized configuration surface. Everything
//! has a sensible default; a missing file means defaults. Canary stage
//! schedules are normalized into their legal bounds at load time and
//! the effective values logged.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use convoy_events::EventBusConfig;
use convoy_lock::LockConfig;
use convoy_phases::{BuildConfig, SecurityConfig};
use convoy_queue::QueueConfig;
use convoy_rollout::{CanaryConfig, DeployConfig};
use convoy_types::{Environment, Strategy};

use crate::error::{EngineError, Result};

/// Per-phase deadlines enforced by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(with = "convoy_types::duration_millis")]
    pub security: Duration,
    #[serde(with = "convoy_types::duration_millis")]
    pub build: Duration,
    /// Covers deploy and verify together.
    #[serde(with = "convoy_types::duration_millis")]
    pub deploy: Duration,
    /// How long a cancelled phase gets to reach a safe checkpoint.
    #[serde(with = "convoy_types::duration_millis")]
    pub cancel_grace: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            security: Duration::from_secs(300),
            build: Duration::from_secs(900),
            deploy: Duration::from_secs(900),
            cancel_grace: Duration::from_secs(30),
        }
    }
}

/// A repository/branch pair webhooks may deploy, with the job template
/// to use when one fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub repository: String,
    pub branch: String,
    pub instance_id: String,
    pub environment: Environment,
    pub strategy: Strategy,
    pub port: u16,
    pub health_path: String,
}

/// The full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub security: SecurityConfig,
    pub build: BuildConfig,
    pub deploy: DeployConfig,
    pub canary: CanaryConfig,
    pub events: EventBusConfig,
    pub timeouts: PhaseTimeouts,
    pub webhooks: Vec<WebhookTarget>,
    /// Extra redaction patterns layered over the defaults.
    pub redact_patterns: Vec<String>,
}

impl ConvoyConfig {
    /// Load from `path`, or the default location, or fall back to
    /// defaults when no file exists. The result is normalized.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .map_err(|e| EngineError::Config(e.to_string()))?;
            toml::from_str(&contents).map_err(|e| EngineError::Config(e.to_string()))?
        } else {
            ConvoyConfig::default()
        };
        config.normalize();
        Ok(config)
    }

    /// Clamp the canary schedule into its legal bounds and log the
    /// effective values.
    pub fn normalize(&mut self) {
        let before: Vec<(u8, u64)> = self
            .canary
            .stages
            .iter()
            .map(|s| (s.weight, s.duration.as_secs()))
            .collect();
        for stage in &mut self.canary.stages {
            *stage = stage.clamped();
        }
        let after: Vec<(u8, u64)> = self
            .canary
            .stages
            .iter()
            .map(|s| (s.weight, s.duration.as_secs()))
            .collect();
        if before != after {
            info!(requested = ?before, effective = ?after, "canary schedule clamped");
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| EngineError::Config("cannot find config directory".into()))?;
        Ok(config_dir.join("convoy").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_defaults() {
        let config = ConvoyConfig::load(Some("/nonexistent/convoy.toml")).unwrap();
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.lock.renew_divisor, 3);
        assert_eq!(config.deploy.window.samples, 12);
    }

    #[test]
    fn normalize_clamps_canary_stages() {
        let mut config = ConvoyConfig::default();
        config.canary.stages[0].weight = 12;
        config.canary.stages[0].duration = Duration::from_secs(5);
        config.normalize();
        assert_eq!(config.canary.stages[0].weight, 10);
        assert_eq!(config.canary.stages[0].duration, Duration::from_secs(60));
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
            [queue]
            visibility_timeout = 300000
            max_retries = 5
            priority_bands = 4
            backoff_base = 10000

            [timeouts]
            security = 60000
            build = 120000
            deploy = 120000
            cancel_grace = 10000
        "#;
        let config: ConvoyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.timeouts.security, Duration::from_secs(60));
        // Unspecified sections fall back to defaults.
        assert_eq!(config.deploy.window.min_success, 10);
    }
}
