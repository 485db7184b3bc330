//! Event-sink port

use async_trait::async_trait;

use convoy_types::{DeploymentId, EventPayload};

use crate::error::StoreError;

/// Where pipeline events go. The in-process bus implements this; tests
/// substitute a recorder.
///
/// The sink owns sequencing: it assigns the per-deployment `seq` and
/// timestamp, and returns the assigned seq. Publishing must not block
/// the caller beyond the sink's own bounded buffering.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        deployment_id: DeploymentId,
        payload: EventPayload,
    ) -> Result<u64, StoreError>;
}
