//! In-memory store implementation
//!
//! Suitable for development and testing. Production deployments use a
//! persistent backend behind the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use convoy_types::{
    BuildArtifact, DeploymentEvent, DeploymentId, DeploymentRecord, HealthSample, InstanceId,
    Phase, PhaseRecord, PhaseStatus, SecurityDecision,
};

use crate::error::StoreError;
use crate::store::Store;

/// In-memory row store with the same idempotence and terminal-immutability
/// contract as a persistent backend.
#[derive(Default)]
pub struct InMemoryStore {
    records: DashMap<DeploymentId, DeploymentRecord>,
    phases: DashMap<(DeploymentId, Phase, u32), PhaseRecord>,
    decisions: DashMap<(DeploymentId, u32), SecurityDecision>,
    artifacts: DashMap<(DeploymentId, u32), BuildArtifact>,
    samples: DashMap<DeploymentId, Vec<(Phase, u32, HealthSample)>>,
    events: DashMap<DeploymentId, Vec<DeploymentEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going down; every call fails with
    /// `Unavailable` until cleared. Used by fault-injection tests.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    /// All health samples recorded for a deployment, for assertions.
    pub fn health_samples(&self, id: DeploymentId) -> Vec<(Phase, u32, HealthSample)> {
        self.samples.get(&id).map(|v| v.clone()).unwrap_or_default()
    }

    /// The stored decision for an attempt, for assertions.
    pub fn decision(&self, id: DeploymentId, attempt: u32) -> Option<SecurityDecision> {
        self.decisions.get(&(id, attempt)).map(|d| d.clone())
    }

    /// The stored artifact for an attempt, for assertions.
    pub fn artifact(&self, id: DeploymentId, attempt: u32) -> Option<BuildArtifact> {
        self.artifacts.get(&(id, attempt)).map(|a| a.clone())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_record(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(existing) = self.records.get(&record.deployment_id) {
            if existing.status.is_terminal() {
                return Err(StoreError::TerminalImmutable(
                    record.deployment_id.to_string(),
                ));
            }
        }
        self.records.insert(record.deployment_id, record.clone());
        Ok(())
    }

    async fn get_record(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn latest_deployed_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        self.check_available()?;
        let mut latest: Option<DeploymentRecord> = None;
        for entry in self.records.iter() {
            let record = entry.value();
            if record.instance_id != *instance_id
                || record.status != convoy_types::DeploymentStatus::Deployed
            {
                continue;
            }
            let newer = match &latest {
                None => true,
                Some(prev) => {
                    (record.completed_at, record.deployment_id)
                        > (prev.completed_at, prev.deployment_id)
                }
            };
            if newer {
                latest = Some(record.clone());
            }
        }
        Ok(latest)
    }

    async fn put_phase(&self, record: &PhaseRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let key = (record.deployment_id, record.phase, record.attempt);
        if let Some(existing) = self.phases.get(&key) {
            if existing.status != PhaseStatus::Running {
                // Final rows are write-once.
                return Ok(());
            }
        }
        self.phases.insert(key, record.clone());
        Ok(())
    }

    async fn list_phases(&self, id: DeploymentId) -> Result<Vec<PhaseRecord>, StoreError> {
        self.check_available()?;
        let mut rows: Vec<PhaseRecord> = self
            .phases
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.phase, r.attempt));
        Ok(rows)
    }

    async fn put_decision(
        &self,
        id: DeploymentId,
        attempt: u32,
        decision: &SecurityDecision,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.decisions.entry((id, attempt)).or_insert_with(|| decision.clone());
        Ok(())
    }

    async fn put_artifact(
        &self,
        id: DeploymentId,
        attempt: u32,
        artifact: &BuildArtifact,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.artifacts.entry((id, attempt)).or_insert_with(|| artifact.clone());
        Ok(())
    }

    async fn append_health_sample(
        &self,
        id: DeploymentId,
        phase: Phase,
        attempt: u32,
        sample: &HealthSample,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.samples
            .entry(id)
            .or_default()
            .push((phase, attempt, sample.clone()));
        Ok(())
    }

    async fn append_event(&self, event: &DeploymentEvent) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rows = self.events.entry(event.deployment_id).or_default();
        if rows.iter().any(|e| e.seq == event.seq) {
            return Ok(());
        }
        rows.push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        id: DeploymentId,
        from_seq: u64,
    ) -> Result<Vec<DeploymentEvent>, StoreError> {
        self.check_available()?;
        let mut rows: Vec<DeploymentEvent> = self
            .events
            .get(&id)
            .map(|v| v.iter().filter(|e| e.seq >= from_seq).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|e| e.seq);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_types::{DeploymentStatus, Environment, JobId, Strategy};

    fn record(status: DeploymentStatus) -> DeploymentRecord {
        let mut r = DeploymentRecord::new(
            DeploymentId::generate(),
            JobId::generate(),
            InstanceId::parse("i-abc").unwrap(),
            Environment::Production,
            Strategy::Rolling,
            Utc::now(),
        );
        r.status = status;
        r
    }

    #[tokio::test]
    async fn terminal_records_are_write_once() {
        let store = InMemoryStore::new();
        let mut r = record(DeploymentStatus::Deployed);
        store.put_record(&r).await.unwrap();

        r.status = DeploymentStatus::Failed;
        let err = store.put_record(&r).await.unwrap_err();
        assert!(matches!(err, StoreError::TerminalImmutable(_)));
    }

    #[tokio::test]
    async fn final_phase_rows_are_write_once() {
        let store = InMemoryStore::new();
        let id = DeploymentId::generate();
        let mut row = PhaseRecord::started(id, Phase::Build, 1, Utc::now());
        store.put_phase(&row).await.unwrap();

        row.status = PhaseStatus::Succeeded;
        store.put_phase(&row).await.unwrap();

        // A later write under the same key changes nothing.
        row.status = PhaseStatus::Failed;
        store.put_phase(&row).await.unwrap();
        let rows = store.list_phases(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PhaseStatus::Succeeded);
    }

    #[tokio::test]
    async fn latest_deployed_picks_most_recent_completion() {
        let store = InMemoryStore::new();
        let instance = InstanceId::parse("i-abc").unwrap();

        let mut older = record(DeploymentStatus::Deployed);
        older.instance_id = instance.clone();
        older.current_image_tag = Some("app:old".into());
        older.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.put_record(&older).await.unwrap();

        let mut newer = record(DeploymentStatus::Deployed);
        newer.instance_id = instance.clone();
        newer.current_image_tag = Some("app:new".into());
        newer.completed_at = Some(Utc::now());
        store.put_record(&newer).await.unwrap();

        let found = store
            .latest_deployed_for_instance(&instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.current_image_tag.as_deref(), Some("app:new"));
    }

    #[tokio::test]
    async fn duplicate_event_seq_is_a_no_op() {
        let store = InMemoryStore::new();
        let id = DeploymentId::generate();
        let event = DeploymentEvent {
            deployment_id: id,
            seq: 1,
            timestamp: Utc::now(),
            payload: convoy_types::EventPayload::LogLine { line: "a".into() },
        };
        store.append_event(&event).await.unwrap();
        store.append_event(&event).await.unwrap();
        assert_eq!(store.list_events(id, 0).await.unwrap().len(), 1);
    }
}
