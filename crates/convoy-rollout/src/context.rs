//! Rollout context
//!
//! The bridge between a strategy and the outside world. Wraps the ports
//! a rollout touches, carries the cancellation token, and accumulates
//! the phase payload the deploy phase persists afterwards.

use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use convoy_audit::AuditGateway;
use convoy_ports::{Clock, EventSink, HealthProber, RemoteExecutor};
use convoy_types::{
    CommandId, DeploymentId, EventPayload, HealthSample, InstanceId, Phase,
};

use crate::deployer::{DeployError, Result};

pub struct RolloutContext {
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HealthProber>,
    events: Arc<dyn EventSink>,
    audit: Arc<AuditGateway>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    deployment_id: DeploymentId,
    payload: Mutex<serde_json::Map<String, Value>>,
}

impl RolloutContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn HealthProber>,
        events: Arc<dyn EventSink>,
        audit: Arc<AuditGateway>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        deployment_id: DeploymentId,
    ) -> Self {
        Self {
            executor,
            prober,
            events,
            audit,
            clock,
            cancel,
            deployment_id,
            payload: Mutex::new(serde_json::Map::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn prober(&self) -> &Arc<dyn HealthProber> {
        &self.prober
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a key into the phase payload persisted after the rollout.
    pub fn set_payload(&self, key: &str, value: impl Into<Value>) {
        self.payload.lock().unwrap().insert(key.to_string(), value.into());
    }

    /// The accumulated phase payload.
    pub fn take_payload(&self) -> Option<Value> {
        let map = std::mem::take(&mut *self.payload.lock().unwrap());
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    /// Emit a stage transition.
    pub async fn stage(&self, stage: &str, detail: Option<String>) -> Result<()> {
        debug!(deployment_id = %self.deployment_id, stage, "rollout stage");
        self.events
            .publish(
                self.deployment_id,
                EventPayload::PhaseProgress {
                    phase: Phase::Deploy,
                    stage: stage.to_string(),
                    detail,
                },
            )
            .await
            .map_err(|e| DeployError::EventStream(e.to_string()))?;
        Ok(())
    }

    /// Emit a rollback start, always before any remediation runs.
    pub async fn rollback_started(
        &self,
        reason: &str,
        previous_image_tag: Option<&str>,
    ) -> Result<()> {
        warn!(deployment_id = %self.deployment_id, reason, "rollback starting");
        self.events
            .publish(
                self.deployment_id,
                EventPayload::RollbackStarted {
                    reason: reason.to_string(),
                    previous_image_tag: previous_image_tag.map(|s| s.to_string()),
                },
            )
            .await
            .map_err(|e| DeployError::EventStream(e.to_string()))?;
        Ok(())
    }

    /// Emit and persist one health sample.
    pub async fn health_sampled(&self, attempt: u32, sample: &HealthSample) -> Result<()> {
        self.audit
            .health_sample(self.deployment_id, Phase::Deploy, attempt, sample)
            .await
            .map_err(|e| DeployError::EventStream(e.to_string()))?;
        self.events
            .publish(
                self.deployment_id,
                EventPayload::HealthSampled {
                    sample: sample.clone(),
                },
            )
            .await
            .map_err(|e| DeployError::EventStream(e.to_string()))?;
        Ok(())
    }

    /// Run a remote script step. Returns the script's exit success;
    /// transport failures surface as `Unreachable`.
    pub async fn run_script(
        &self,
        instance_id: &InstanceId,
        step: &str,
        attempt: u32,
        script: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let command_id = CommandId::derive(self.deployment_id, Phase::Deploy, step, attempt);
        let output = self
            .executor
            .run(instance_id, &command_id, script, timeout)
            .await
            .map_err(|e| DeployError::Unreachable(e.to_string()))?;
        if !output.success() {
            warn!(
                deployment_id = %self.deployment_id,
                step,
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "remote step failed"
            );
        }
        Ok(output.success())
    }

    /// One probe, mapped into a sample whether or not transport worked.
    pub async fn probe_once(&self, url: &str, timeout: Duration, attempt: u32) -> HealthSample {
        match self.prober.probe(url, timeout, attempt).await {
            Ok(sample) => sample,
            Err(e) => HealthSample::failed(attempt, e.to_string(), 0, self.clock.now()),
        }
    }
}
