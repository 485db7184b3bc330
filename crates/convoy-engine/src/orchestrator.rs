//! The driver facade
//!
//! Wires the whole pipeline from the capability ports and exposes the
//! three operations drivers use: submit a job, read a record, subscribe
//! to a live stream that opens with a snapshot. Also normalizes webhook
//! pushes into jobs and owns worker/sweeper lifecycle.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use convoy_audit::{AuditGateway, Redactor};
use convoy_events::{EventBus, Subscription};
use convoy_lock::{InstanceLock, LockBackend};
use convoy_phases::{BuildPhase, DeployPhase, PhaseRecorder, SecurityPhase};
use convoy_ports::{
    Clock, ContainerBuilder, EventSink, HealthProber, ImageScanner, RemoteExecutor, Store, Vcs,
};
use convoy_queue::DeploymentQueue;
use convoy_types::{
    DeploymentEvent, DeploymentId, DeploymentJob, DeploymentRecord, Environment, EventPayload,
    InstanceId, JobId, TriggeredBy,
};

use crate::config::ConvoyConfig;
use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result};
use crate::worker::Worker;

/// A normalized webhook push.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub repository: String,
    pub git_ref: String,
    pub commit_sha: String,
}

impl WebhookEvent {
    /// Branch name with any `refs/heads/` prefix stripped.
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }
}

/// A subscription that opens with a `Snapshot` of the current record
/// and then yields live events.
pub struct EventStream {
    snapshot: Option<DeploymentEvent>,
    snapshot_seq: u64,
    inner: Subscription,
}

impl EventStream {
    /// Next event, `None` when the stream is over.
    pub async fn recv(&mut self) -> Option<DeploymentEvent> {
        if let Some(snapshot) = self.snapshot.take() {
            return Some(snapshot);
        }
        loop {
            let event = self.inner.recv().await?;
            // Events published before the snapshot was taken are already
            // reflected in it.
            if event.seq > self.snapshot_seq {
                return Some(event);
            }
        }
    }
}

pub struct Orchestrator {
    config: ConvoyConfig,
    store: Arc<dyn Store>,
    audit: Arc<AuditGateway>,
    bus: Arc<EventBus>,
    queue: Arc<DeploymentQueue>,
    lock: Arc<InstanceLock>,
    coordinator: Arc<Coordinator>,
    cancels: Arc<DashMap<DeploymentId, CancellationToken>>,
    /// Ids accepted into the queue, for duplicate-submission checks
    /// before the coordinator has created any record.
    submitted: DashSet<DeploymentId>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Wire the pipeline from its ports.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vcs: Arc<dyn Vcs>,
        scanner: Arc<dyn ImageScanner>,
        builder: Arc<dyn ContainerBuilder>,
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn HealthProber>,
        store: Arc<dyn Store>,
        lock_backend: Arc<dyn LockBackend>,
        clock: Arc<dyn Clock>,
        config: ConvoyConfig,
    ) -> Self {
        let redactor = Arc::new(Redactor::with_extra_patterns(
            config.redact_patterns.iter().cloned(),
        ));
        let audit = Arc::new(AuditGateway::new(store.clone(), redactor));
        let bus = Arc::new(EventBus::new(
            audit.clone(),
            clock.clone(),
            config.events.clone(),
        ));
        let events: Arc<dyn EventSink> = bus.clone();
        let recorder = Arc::new(PhaseRecorder::new(
            audit.clone(),
            events.clone(),
            clock.clone(),
        ));

        let security = SecurityPhase::new(vcs, scanner, recorder.clone(), config.security.clone());
        let build = BuildPhase::new(builder, recorder.clone(), config.build.clone());
        let deploy = DeployPhase::new(
            executor.clone(),
            prober.clone(),
            recorder.clone(),
            config.deploy.clone(),
            config.canary.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(
            security,
            build,
            deploy,
            recorder,
            events,
            executor,
            prober,
            config.deploy.window.clone(),
            config.timeouts.clone(),
        ));

        let queue = Arc::new(DeploymentQueue::new(clock.clone(), config.queue.clone()));
        let lock = Arc::new(InstanceLock::new(lock_backend, config.lock.clone()));

        Self {
            config,
            store,
            audit,
            bus,
            queue,
            lock,
            coordinator,
            cancels: Arc::new(DashMap::new()),
            submitted: DashSet::new(),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Submit a job. Returns the canonical deployment id: the driver's
    /// if it supplied one, otherwise minted at enqueue. Submitting the
    /// same id again returns it unchanged while the deployment is live,
    /// and is rejected as a duplicate once it is terminal.
    #[instrument(skip_all, fields(repository = %job.repository))]
    pub async fn submit(&self, job: DeploymentJob) -> Result<DeploymentId> {
        job.validate()?;

        if let Some(id) = job.deployment_id {
            if let Some(existing) = self.store.get_record(id).await? {
                if existing.status.is_terminal() {
                    return Err(EngineError::DuplicateDeployment(id));
                }
                info!(%id, "duplicate submission of live deployment, returning existing id");
                return Ok(id);
            }
            if self.submitted.contains(&id) {
                info!(%id, "duplicate submission of queued deployment, returning existing id");
                return Ok(id);
            }
        }

        for var in job.env_vars.iter().filter(|v| v.secret) {
            self.audit.redactor().register_secret(var.value.clone());
        }

        let id = self.queue.push(job);
        self.submitted.insert(id);
        info!(%id, "job submitted");
        Ok(id)
    }

    /// Normalize a webhook push into a submission, if it matches a
    /// configured target. Signature verification happened upstream.
    pub async fn submit_webhook(&self, event: WebhookEvent) -> Result<Option<DeploymentId>> {
        let Some(target) = self
            .config
            .webhooks
            .iter()
            .find(|t| t.repository == event.repository && t.branch == event.branch())
        else {
            return Ok(None);
        };
        let job = DeploymentJob {
            job_id: JobId::generate(),
            deployment_id: None,
            repository: event.repository.clone(),
            git_ref: event.branch().to_string(),
            commit_sha: Some(event.commit_sha.clone()),
            instance_id: InstanceId::parse(&target.instance_id)?,
            environment: target.environment,
            strategy: target.strategy,
            port: target.port,
            health_path: target.health_path.clone(),
            env_vars: vec![],
            priority: 0,
            submitted_at: self.clock.now(),
            triggered_by: TriggeredBy::Webhook,
            retry_count: 0,
        };
        self.submit(job).await.map(Some)
    }

    /// Current record for a deployment.
    pub async fn get(&self, id: DeploymentId) -> Result<DeploymentRecord> {
        self.store
            .get_record(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Subscribe to a deployment's stream: a `Snapshot` of the current
    /// record first, then live events from the next seq on.
    pub async fn subscribe(&self, id: DeploymentId) -> Result<EventStream> {
        let inner = self.bus.subscribe(Some(id));
        let record = self.get(id).await?;
        let snapshot_seq = self.bus.current_seq(id);
        let snapshot = DeploymentEvent {
            deployment_id: id,
            seq: snapshot_seq,
            timestamp: self.clock.now(),
            payload: EventPayload::Snapshot {
                record: Box::new(record),
            },
        };
        Ok(EventStream {
            snapshot: Some(snapshot),
            snapshot_seq,
            inner,
        })
    }

    /// Signal cancellation for an in-flight deployment.
    pub fn cancel(&self, id: DeploymentId) {
        if let Some(token) = self.cancels.get(&id) {
            token.cancel();
            info!(%id, "cancellation signalled");
        }
    }

    /// Spawn `count` workers for an environment.
    pub fn start_workers(&self, environment: Environment, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|_| {
                Worker::new(
                    self.queue.clone(),
                    self.lock.clone(),
                    self.coordinator.clone(),
                    environment,
                    self.cancels.clone(),
                )
                .spawn(self.shutdown.clone())
            })
            .collect()
    }

    /// Spawn the queue recovery sweeper.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        // Sweep at a fraction of the visibility timeout so recovery lag
        // stays well under `visibility_timeout + sweep interval`.
        let interval = self
            .config
            .queue
            .visibility_timeout
            .checked_div(4)
            .unwrap_or(Duration::from_secs(60));
        self.queue.spawn_sweeper(interval, self.shutdown.clone())
    }

    /// Stop workers and the sweeper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn queue(&self) -> &Arc<DeploymentQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
