//! Persistence port
//!
//! Row-level reads and writes for the pipeline's entities. Writes are
//! idempotent by natural key: `deployment_id` for records, `(deployment_id,
//! phase, attempt)` for phase rows and their payloads, `(deployment_id,
//! seq)` for events. Terminal deployment records are write-once.

use async_trait::async_trait;

use convoy_types::{
    BuildArtifact, DeploymentEvent, DeploymentId, DeploymentRecord, HealthSample, InstanceId,
    Phase, PhaseRecord, SecurityDecision,
};

use crate::error::StoreError;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a deployment record. Fails with
    /// `TerminalImmutable` when the stored record already carries a
    /// terminal status.
    async fn put_record(&self, record: &DeploymentRecord) -> Result<(), StoreError>;

    async fn get_record(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError>;

    /// The most recently completed `Deployed` record for an instance,
    /// used to learn the previous image tag before a rollout.
    async fn latest_deployed_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Write a phase row. A second write for a key whose stored row has
    /// already reached a final status is a no-op.
    async fn put_phase(&self, record: &PhaseRecord) -> Result<(), StoreError>;

    async fn list_phases(&self, id: DeploymentId) -> Result<Vec<PhaseRecord>, StoreError>;

    /// Persist the security decision for one attempt; duplicate writes
    /// are no-ops.
    async fn put_decision(
        &self,
        id: DeploymentId,
        attempt: u32,
        decision: &SecurityDecision,
    ) -> Result<(), StoreError>;

    /// Persist the build artifact for one attempt; duplicate writes are
    /// no-ops.
    async fn put_artifact(
        &self,
        id: DeploymentId,
        attempt: u32,
        artifact: &BuildArtifact,
    ) -> Result<(), StoreError>;

    async fn append_health_sample(
        &self,
        id: DeploymentId,
        phase: Phase,
        attempt: u32,
        sample: &HealthSample,
    ) -> Result<(), StoreError>;

    /// Append an event row; `(deployment_id, seq)` collisions are no-ops.
    async fn append_event(&self, event: &DeploymentEvent) -> Result<(), StoreError>;

    async fn list_events(
        &self,
        id: DeploymentId,
        from_seq: u64,
    ) -> Result<Vec<DeploymentEvent>, StoreError>;
}
