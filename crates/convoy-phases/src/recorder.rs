//! Shared phase bookkeeping
//!
//! Entry and exit rows plus their events, written identically by every
//! executor so the audit trail has one shape.

use std::sync::Arc;

use convoy_audit::AuditGateway;
use convoy_ports::{Clock, EventSink};
use convoy_types::{
    DeploymentId, EventPayload, Phase, PhaseRecord, PhaseStatus,
};

use crate::result::PhaseFailure;

/// Writes the `(deployment_id, phase, attempt)` row pair and narrates
/// phase lifecycle events.
pub struct PhaseRecorder {
    audit: Arc<AuditGateway>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl PhaseRecorder {
    pub fn new(audit: Arc<AuditGateway>, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            audit,
            events,
            clock,
        }
    }

    pub fn audit(&self) -> &Arc<AuditGateway> {
        &self.audit
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write the entry row and `PhaseStarted` event. Returns the row to
    /// be completed at exit.
    pub async fn enter(
        &self,
        deployment_id: DeploymentId,
        phase: Phase,
        attempt: u32,
    ) -> Result<PhaseRecord, convoy_audit::AuditError> {
        let record = PhaseRecord::started(deployment_id, phase, attempt, self.clock.now());
        self.audit.phase(&record).await?;
        self.events
            .publish(deployment_id, EventPayload::PhaseStarted { phase, attempt })
            .await
            .map_err(convoy_audit::AuditError::Store)?;
        Ok(record)
    }

    /// Complete the row as succeeded, with an optional payload.
    pub async fn succeed(
        &self,
        mut record: PhaseRecord,
        payload: Option<serde_json::Value>,
    ) -> Result<(), convoy_audit::AuditError> {
        record.status = PhaseStatus::Succeeded;
        record.finished_at = Some(self.clock.now());
        record.payload = payload;
        self.audit.phase(&record).await?;
        self.events
            .publish(
                record.deployment_id,
                EventPayload::PhaseCompleted {
                    phase: record.phase,
                    attempt: record.attempt,
                },
            )
            .await
            .map_err(convoy_audit::AuditError::Store)?;
        Ok(())
    }

    /// Complete the row as failed.
    pub async fn fail(
        &self,
        mut record: PhaseRecord,
        failure: &PhaseFailure,
        payload: Option<serde_json::Value>,
    ) -> Result<(), convoy_audit::AuditError> {
        record.status = PhaseStatus::Failed;
        record.finished_at = Some(self.clock.now());
        record.failure = Some((failure.kind, failure.detail.clone()));
        record.payload = payload;
        self.audit.phase(&record).await?;
        self.events
            .publish(
                record.deployment_id,
                EventPayload::PhaseFailed {
                    phase: record.phase,
                    attempt: record.attempt,
                    kind: failure.kind,
                    detail: failure.detail.clone(),
                },
            )
            .await
            .map_err(convoy_audit::AuditError::Store)?;
        Ok(())
    }
}
