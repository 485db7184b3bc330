//! The audit gateway

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use convoy_ports::{Store, StoreError};
use convoy_types::{
    BuildArtifact, DeploymentEvent, DeploymentId, DeploymentRecord, HealthSample, Phase,
    PhaseRecord, SecurityDecision,
};

use crate::redact::Redactor;

/// Gateway errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Buffered health sample awaiting a flush.
struct PendingSample {
    deployment_id: DeploymentId,
    phase: Phase,
    attempt: u32,
    sample: HealthSample,
}

/// Append-only writer for the audit trail.
///
/// Status rows, phase rows, decisions, and artifacts write through
/// immediately; health samples batch per phase and flush on phase exit
/// and on terminal transitions. Idempotence comes from the store's
/// natural keys, so a crashed-and-resumed phase re-writing its rows is
/// harmless.
pub struct AuditGateway {
    store: Arc<dyn Store>,
    redactor: Arc<Redactor>,
    pending_samples: Mutex<Vec<PendingSample>>,
}

impl AuditGateway {
    pub fn new(store: Arc<dyn Store>, redactor: Arc<Redactor>) -> Self {
        Self {
            store,
            redactor,
            pending_samples: Mutex::new(Vec::new()),
        }
    }

    pub fn redactor(&self) -> &Arc<Redactor> {
        &self.redactor
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Write a deployment record transition.
    pub async fn record(&self, record: &DeploymentRecord) -> Result<()> {
        let mut record = record.clone();
        self.redactor.redact_record(&mut record);
        self.store.put_record(&record).await?;
        Ok(())
    }

    /// Write a terminal record, flushing buffered rows first so nothing
    /// for this deployment lands after the terminal row.
    #[instrument(skip(self, record), fields(deployment_id = %record.deployment_id, status = %record.status))]
    pub async fn record_terminal(&self, record: &DeploymentRecord) -> Result<()> {
        self.flush().await?;
        self.record(record).await
    }

    /// Write a phase row (entry or exit). Exit rows flush the phase's
    /// buffered samples first.
    pub async fn phase(&self, record: &PhaseRecord) -> Result<()> {
        let mut record = record.clone();
        self.redactor.redact_phase(&mut record);
        if record.finished_at.is_some() {
            self.flush_phase(record.deployment_id, record.phase).await?;
        }
        self.store.put_phase(&record).await?;
        Ok(())
    }

    pub async fn decision(
        &self,
        id: DeploymentId,
        attempt: u32,
        decision: &SecurityDecision,
    ) -> Result<()> {
        let mut decision = decision.clone();
        decision.reasoning = self.redactor.redact(&decision.reasoning);
        self.store.put_decision(id, attempt, &decision).await?;
        Ok(())
    }

    pub async fn artifact(
        &self,
        id: DeploymentId,
        attempt: u32,
        artifact: &BuildArtifact,
    ) -> Result<()> {
        self.store.put_artifact(id, attempt, artifact).await?;
        Ok(())
    }

    /// Buffer a health sample for the next flush.
    pub async fn health_sample(
        &self,
        id: DeploymentId,
        phase: Phase,
        attempt: u32,
        sample: &HealthSample,
    ) -> Result<()> {
        let mut sample = sample.clone();
        if let Some(error) = &mut sample.error {
            *error = self.redactor.redact(error);
        }
        self.pending_samples.lock().await.push(PendingSample {
            deployment_id: id,
            phase,
            attempt,
            sample,
        });
        Ok(())
    }

    /// Write an event row. Called by the bus before fan-out; the event
    /// is redacted in place so subscribers see the same scrubbed copy
    /// that was persisted.
    pub async fn event(&self, event: &mut DeploymentEvent) -> Result<()> {
        self.redactor.redact_event(event);
        self.store.append_event(event).await?;
        Ok(())
    }

    /// Flush every buffered row.
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<PendingSample> = self.pending_samples.lock().await.drain(..).collect();
        if !pending.is_empty() {
            debug!(rows = pending.len(), "flushing buffered health samples");
        }
        for row in pending {
            self.store
                .append_health_sample(row.deployment_id, row.phase, row.attempt, &row.sample)
                .await?;
        }
        Ok(())
    }

    async fn flush_phase(&self, id: DeploymentId, phase: Phase) -> Result<()> {
        let rows: Vec<PendingSample> = {
            let mut pending = self.pending_samples.lock().await;
            let mut rows = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].deployment_id == id && pending[i].phase == phase {
                    rows.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
            rows
        };
        for row in rows {
            self.store
                .append_health_sample(row.deployment_id, row.phase, row.attempt, &row.sample)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_ports::InMemoryStore;
    use convoy_types::{
        DeploymentStatus, Environment, EventPayload, InstanceId, JobId, PhaseStatus, Strategy,
    };

    fn gateway_with_store() -> (Arc<InMemoryStore>, AuditGateway) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = AuditGateway::new(store.clone(), Arc::new(Redactor::new()));
        (store, gateway)
    }

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(
            DeploymentId::generate(),
            JobId::generate(),
            InstanceId::parse("i-abc").unwrap(),
            Environment::Production,
            Strategy::Rolling,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn samples_buffer_until_phase_exit() {
        let (store, gateway) = gateway_with_store();
        let id = DeploymentId::generate();

        let sample = HealthSample::ok(1, 200, 4, Utc::now());
        gateway
            .health_sample(id, Phase::Deploy, 1, &sample)
            .await
            .unwrap();
        assert!(store.health_samples(id).is_empty());

        let mut exit = PhaseRecord::started(id, Phase::Deploy, 1, Utc::now());
        exit.status = PhaseStatus::Succeeded;
        exit.finished_at = Some(Utc::now());
        gateway.phase(&exit).await.unwrap();

        assert_eq!(store.health_samples(id).len(), 1);
    }

    #[tokio::test]
    async fn terminal_record_flushes_everything_first() {
        let (store, gateway) = gateway_with_store();
        let mut rec = record();
        gateway.record(&rec).await.unwrap();

        let sample = HealthSample::ok(1, 200, 4, Utc::now());
        gateway
            .health_sample(rec.deployment_id, Phase::Verify, 1, &sample)
            .await
            .unwrap();

        rec.status = DeploymentStatus::Deployed;
        rec.completed_at = Some(Utc::now());
        gateway.record_terminal(&rec).await.unwrap();

        assert_eq!(store.health_samples(rec.deployment_id).len(), 1);
        let stored = store.get_record(rec.deployment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn events_are_redacted_before_persisting() {
        let (store, gateway) = gateway_with_store();
        gateway.redactor().register_secret("hunter2");
        let id = DeploymentId::generate();

        let mut event = DeploymentEvent {
            deployment_id: id,
            seq: 1,
            timestamp: Utc::now(),
            payload: EventPayload::LogLine {
                line: "DB_PASS is hunter2".into(),
            },
        };
        gateway.event(&mut event).await.unwrap();

        let rows = store.list_events(id, 0).await.unwrap();
        match &rows[0].payload {
            EventPayload::LogLine { line } => assert!(!line.contains("hunter2")),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
