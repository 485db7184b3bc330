//! Worker loop
//!
//! Stateless: pop a job, take the instance lease, run the coordinator,
//! ack or nack. Per-instance serialization comes entirely from the
//! lock; any number of workers may run per environment.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_lock::InstanceLock;
use convoy_queue::{DeploymentQueue, RequeueOutcome};
use convoy_types::{DeploymentId, Environment, OwnerToken};

use crate::coordinator::{Coordinator, RunDisposition};

pub struct Worker {
    queue: Arc<DeploymentQueue>,
    lock: Arc<InstanceLock>,
    coordinator: Arc<Coordinator>,
    environment: Environment,
    /// Cancel tokens shared with the orchestrator so a driver can
    /// cancel an in-flight deployment.
    cancels: Arc<DashMap<DeploymentId, CancellationToken>>,
    pop_block: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<DeploymentQueue>,
        lock: Arc<InstanceLock>,
        coordinator: Arc<Coordinator>,
        environment: Environment,
        cancels: Arc<DashMap<DeploymentId, CancellationToken>>,
    ) -> Self {
        Self {
            queue,
            lock,
            coordinator,
            environment,
            cancels,
            pop_block: Duration::from_secs(30),
        }
    }

    /// Run until shutdown. One job at a time.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(environment = %self.environment, "worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    entry = self.queue.pop(self.environment, OwnerToken::generate(), self.pop_block) => {
                        let Some(entry) = entry else { continue };
                        self.process(entry).await;
                    }
                }
            }
            info!(environment = %self.environment, "worker stopped");
        })
    }

    async fn process(&self, entry: convoy_types::QueueEntry) {
        let Some(deployment_id) = entry.job.deployment_id else {
            // The queue mints ids on push; an entry without one is
            // unprocessable.
            error!(envelope_id = %entry.envelope_id, "entry has no deployment id, dropping");
            let _ = self.queue.ack(self.environment, entry.envelope_id);
            return;
        };

        let owner = OwnerToken::generate();
        let resource = entry.job.instance_id.lock_key();
        let guard = match self.lock.acquire(&resource, owner).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                // Another deployment holds the instance; come back.
                debug!(%deployment_id, resource, "instance busy, deferring");
                let delay = self.queue.config().backoff(entry.job.retry_count);
                let _ = self.queue.defer(self.environment, entry.envelope_id, delay);
                return;
            }
            Err(e) => {
                // Lock store unreachable: fail closed, requeue.
                warn!(%deployment_id, error = %e, "lock store unreachable, deferring");
                let delay = self.queue.config().backoff(entry.job.retry_count);
                let _ = self.queue.defer(self.environment, entry.envelope_id, delay);
                return;
            }
        };

        let external_cancel = self
            .cancels
            .entry(deployment_id)
            .or_insert_with(CancellationToken::new)
            .clone();
        let lock_lost = guard.lost();

        let disposition = self
            .coordinator
            .run(deployment_id, &entry.job, external_cancel, lock_lost.clone())
            .await;

        match disposition {
            Ok(RunDisposition::Terminal(status)) => {
                let _ = self.queue.ack(self.environment, entry.envelope_id);
                self.cancels.remove(&deployment_id);
                debug!(%deployment_id, %status, "job acked");
            }
            Ok(RunDisposition::Retry(failure)) => {
                match self.queue.nack(self.environment, entry.envelope_id) {
                    Ok(RequeueOutcome::Requeued(delay)) => {
                        info!(%deployment_id, delay_ms = delay.as_millis() as u64, "job requeued");
                    }
                    Ok(RequeueOutcome::Exhausted) => {
                        if let Err(e) = self
                            .coordinator
                            .finalize_exhausted(deployment_id, &failure)
                            .await
                        {
                            error!(%deployment_id, error = %e, "failed to finalize exhausted job");
                        }
                        self.cancels.remove(&deployment_id);
                    }
                    Err(e) => error!(%deployment_id, error = %e, "nack failed"),
                }
            }
            Err(e) => {
                // Infrastructure failure inside the coordinator: do not
                // ack; the lease or the sweeper gets it back to pending.
                error!(%deployment_id, error = %e, "coordinator error, leaving job in flight");
            }
        }

        if lock_lost.is_cancelled() {
            // The lease is gone; nothing left to release.
            drop(guard);
        } else if let Err(e) = guard.release().await {
            warn!(%deployment_id, error = %e, "lock release failed (lease will expire)");
        }
    }
}
