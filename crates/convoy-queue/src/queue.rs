//! The deployment queue

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convoy_ports::Clock;
use convoy_types::{
    DeploymentId, DeploymentJob, Environment, EnvelopeId, OwnerToken, QueueEntry, TriggeredBy,
};

/// Queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a popped entry may sit in processing before the sweeper
    /// assumes its worker died.
    #[serde(with = "convoy_types::duration_millis")]
    pub visibility_timeout: Duration,
    /// Nacks beyond this count drop the job.
    pub max_retries: u32,
    /// Number of priority bands; `job.priority` is clamped into range.
    pub priority_bands: u8,
    /// First-retry backoff; doubles per retry, capped at 10x.
    #[serde(with = "convoy_types::duration_millis")]
    pub backoff_base: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(600),
            max_retries: 3,
            priority_bands: 4,
            backoff_base: Duration::from_secs(10),
        }
    }
}

impl QueueConfig {
    /// Exponential backoff with ±20% jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << retry_count.min(16)).min(base * 10);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((exp as f64 * jitter) as u64)
    }
}

/// Queue failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("entry {0} is not in the processing list")]
    NotProcessing(EnvelopeId),
}

/// What happened to a nacked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Re-enqueued; visible again after the returned delay.
    Requeued(Duration),
    /// Retry budget exhausted; the job was dropped.
    Exhausted,
}

struct InFlight {
    entry: QueueEntry,
    popped_at: DateTime<Utc>,
}

#[derive(Default)]
struct EnvState {
    /// One FIFO per band, highest band popped first.
    bands: Vec<VecDeque<QueueEntry>>,
    processing: Vec<InFlight>,
}

struct EnvQueue {
    state: Mutex<EnvState>,
    notify: Notify,
}

impl EnvQueue {
    fn new(bands: u8) -> Self {
        Self {
            state: Mutex::new(EnvState {
                bands: (0..bands.max(1)).map(|_| VecDeque::new()).collect(),
                processing: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }
}

/// Per-environment FIFO with priority bands and a recovery sweeper.
pub struct DeploymentQueue {
    envs: DashMap<Environment, Arc<EnvQueue>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl DeploymentQueue {
    pub fn new(clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            envs: DashMap::new(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn env(&self, env: Environment) -> Arc<EnvQueue> {
        self.envs
            .entry(env)
            .or_insert_with(|| Arc::new(EnvQueue::new(self.config.priority_bands)))
            .clone()
    }

    /// Enqueue a job. Mints the deployment id if the driver did not
    /// supply one; from here on every record carries the returned id.
    pub fn push(&self, mut job: DeploymentJob) -> DeploymentId {
        let deployment_id = *job
            .deployment_id
            .get_or_insert_with(DeploymentId::generate);
        let env = job.environment;
        let band = self.band_for(&job);
        let entry = QueueEntry::new(job, self.clock.now());

        let queue = self.env(env);
        {
            let mut state = queue.state.lock().unwrap();
            state.bands[band].push_back(entry);
        }
        queue.notify.notify_waiters();
        debug!(%deployment_id, environment = %env, band, "job enqueued");
        deployment_id
    }

    /// Pop the next visible entry, blocking up to `block_timeout`.
    ///
    /// The entry moves to the processing list stamped with `owner`; the
    /// caller must `ack` or `nack` it, or the sweeper will requeue it
    /// after the visibility timeout.
    pub async fn pop(
        &self,
        env: Environment,
        owner: OwnerToken,
        block_timeout: Duration,
    ) -> Option<QueueEntry> {
        let queue = self.env(env);
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            let notified = queue.notify.notified();
            if let Some(entry) = self.try_pop(&queue, owner) {
                return Some(entry);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            // Entries delayed by backoff don't notify; poll at a short
            // cadence so they become visible close to on time.
            let wait = (deadline - now).min(Duration::from_millis(100));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn try_pop(&self, queue: &EnvQueue, owner: OwnerToken) -> Option<QueueEntry> {
        let now = self.clock.now();
        let mut state = queue.state.lock().unwrap();
        for band in (0..state.bands.len()).rev() {
            // Within a band, FIFO among currently visible entries.
            let Some(position) = state.bands[band]
                .iter()
                .position(|entry| entry.visible_after <= now)
            else {
                continue;
            };
            let mut entry = state.bands[band].remove(position).unwrap();
            entry.processing_owner = Some(owner);
            state.processing.push(InFlight {
                entry: entry.clone(),
                popped_at: now,
            });
            return Some(entry);
        }
        None
    }

    /// Remove a finished entry from the processing list.
    pub fn ack(&self, env: Environment, envelope_id: EnvelopeId) -> Result<(), QueueError> {
        let queue = self.env(env);
        let mut state = queue.state.lock().unwrap();
        let before = state.processing.len();
        state
            .processing
            .retain(|inflight| inflight.entry.envelope_id != envelope_id);
        if state.processing.len() == before {
            return Err(QueueError::NotProcessing(envelope_id));
        }
        Ok(())
    }

    /// Negative acknowledgement: re-enqueue with backoff, or drop the
    /// job once its retry budget is spent.
    pub fn nack(&self, env: Environment, envelope_id: EnvelopeId) -> Result<RequeueOutcome, QueueError> {
        let queue = self.env(env);
        let mut state = queue.state.lock().unwrap();
        let position = state
            .processing
            .iter()
            .position(|inflight| inflight.entry.envelope_id == envelope_id)
            .ok_or(QueueError::NotProcessing(envelope_id))?;
        let mut entry = state.processing.remove(position).entry;

        if entry.job.retry_count >= self.config.max_retries {
            warn!(
                deployment_id = ?entry.job.deployment_id,
                retries = entry.job.retry_count,
                "retry budget exhausted, dropping job"
            );
            return Ok(RequeueOutcome::Exhausted);
        }

        entry.job.retry_count += 1;
        entry.job.triggered_by = TriggeredBy::Retry;
        let delay = self.config.backoff(entry.job.retry_count);
        entry.visible_after = self.clock.now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        entry.processing_owner = None;

        let band = self.band_for(&entry.job);
        state.bands[band].push_back(entry);
        drop(state);
        queue.notify.notify_waiters();
        Ok(RequeueOutcome::Requeued(delay))
    }

    /// Put a popped entry back untouched, delayed by `delay`. Used when
    /// the worker could not take the instance lock; lock contention is
    /// not a failure and spends no retries.
    pub fn defer(&self, env: Environment, envelope_id: EnvelopeId, delay: Duration) -> Result<(), QueueError> {
        let queue = self.env(env);
        let mut state = queue.state.lock().unwrap();
        let position = state
            .processing
            .iter()
            .position(|inflight| inflight.entry.envelope_id == envelope_id)
            .ok_or(QueueError::NotProcessing(envelope_id))?;
        let mut entry = state.processing.remove(position).entry;
        entry.processing_owner = None;
        entry.visible_after = self.clock.now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        let band = self.band_for(&entry.job);
        state.bands[band].push_back(entry);
        drop(state);
        queue.notify.notify_waiters();
        Ok(())
    }

    /// Return processing entries whose worker has gone quiet to the
    /// pending list. Returns how many were recovered.
    pub fn sweep(&self, env: Environment) -> usize {
        let queue = self.env(env);
        let now = self.clock.now();
        let cutoff =
            now - ChronoDuration::milliseconds(self.config.visibility_timeout.as_millis() as i64);
        let mut state = queue.state.lock().unwrap();
        let mut recovered = 0;
        let mut i = 0;
        while i < state.processing.len() {
            if state.processing[i].popped_at <= cutoff {
                let mut entry = state.processing.remove(i).entry;
                info!(
                    deployment_id = ?entry.job.deployment_id,
                    envelope_id = %entry.envelope_id,
                    "recovering entry from dead worker"
                );
                entry.processing_owner = None;
                entry.visible_after = now;
                let band = self.band_for(&entry.job);
                state.bands[band].push_back(entry);
                recovered += 1;
            } else {
                i += 1;
            }
        }
        drop(state);
        if recovered > 0 {
            queue.notify.notify_waiters();
        }
        recovered
    }

    /// Pending entries for an environment.
    pub fn depth(&self, env: Environment) -> usize {
        let queue = self.env(env);
        let state = queue.state.lock().unwrap();
        state.bands.iter().map(|band| band.len()).sum()
    }

    /// In-flight entries for an environment.
    pub fn processing_count(&self, env: Environment) -> usize {
        self.env(env).state.lock().unwrap().processing.len()
    }

    /// Spawn the recovery sweeper for every environment.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for env in [Environment::Production, Environment::Staging, Environment::Preview] {
                            let recovered = queue.sweep(env);
                            if recovered > 0 {
                                info!(environment = %env, recovered, "visibility sweep recovered entries");
                            }
                        }
                    }
                }
            }
        })
    }

    fn band_for(&self, job: &DeploymentJob) -> usize {
        (job.priority as usize).min(self.config.priority_bands.max(1) as usize - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_ports::ManualClock;
    use convoy_types::{InstanceId, JobId, Strategy};

    fn job(env: Environment, priority: u8) -> DeploymentJob {
        DeploymentJob {
            job_id: JobId::generate(),
            deployment_id: None,
            repository: "octo/api".into(),
            git_ref: "main".into(),
            commit_sha: None,
            instance_id: InstanceId::parse("i-abc").unwrap(),
            environment: env,
            strategy: Strategy::Rolling,
            port: 8080,
            health_path: "/health".into(),
            env_vars: vec![],
            priority,
            submitted_at: Utc::now(),
            triggered_by: TriggeredBy::Cli,
            retry_count: 0,
        }
    }

    fn queue() -> (Arc<ManualClock>, DeploymentQueue) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = DeploymentQueue::new(clock.clone(), QueueConfig::default());
        (clock, queue)
    }

    const BLOCK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn fifo_within_a_band() {
        let (_, queue) = queue();
        let first = queue.push(job(Environment::Staging, 0));
        let second = queue.push(job(Environment::Staging, 0));

        let owner = OwnerToken::generate();
        let a = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        let b = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(a.job.deployment_id, Some(first));
        assert_eq!(b.job.deployment_id, Some(second));
    }

    #[tokio::test]
    async fn higher_band_pops_first() {
        let (_, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let urgent = queue.push(job(Environment::Staging, 3));

        let owner = OwnerToken::generate();
        let popped = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(popped.job.deployment_id, Some(urgent));
    }

    #[tokio::test]
    async fn environments_are_isolated() {
        let (_, queue) = queue();
        queue.push(job(Environment::Production, 0));
        let owner = OwnerToken::generate();
        assert!(queue.pop(Environment::Staging, owner, BLOCK).await.is_none());
        assert!(queue.pop(Environment::Production, owner, BLOCK).await.is_some());
    }

    #[tokio::test]
    async fn push_mints_a_deployment_id_once() {
        let (_, queue) = queue();
        let id = queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(entry.job.deployment_id, Some(id));
    }

    #[tokio::test]
    async fn nack_backs_off_and_increments_retry_count() {
        let (clock, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();

        let outcome = queue.nack(Environment::Staging, entry.envelope_id).unwrap();
        assert!(matches!(outcome, RequeueOutcome::Requeued(_)));

        // Not visible until the backoff lapses.
        assert!(queue.pop(Environment::Staging, owner, BLOCK).await.is_none());
        clock.advance(Duration::from_secs(60));
        let retried = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(retried.job.retry_count, 1);
        assert_eq!(retried.job.triggered_by, TriggeredBy::Retry);
    }

    #[tokio::test]
    async fn nack_drops_after_max_retries() {
        let (clock, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();

        for _ in 0..3 {
            clock.advance(Duration::from_secs(120));
            let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
            assert!(matches!(
                queue.nack(Environment::Staging, entry.envelope_id).unwrap(),
                RequeueOutcome::Requeued(_)
            ));
        }
        clock.advance(Duration::from_secs(120));
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(
            queue.nack(Environment::Staging, entry.envelope_id).unwrap(),
            RequeueOutcome::Exhausted
        );
        clock.advance(Duration::from_secs(600));
        assert!(queue.pop(Environment::Staging, owner, BLOCK).await.is_none());
    }

    #[tokio::test]
    async fn sweep_recovers_entries_from_dead_workers() {
        let (clock, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();

        // Worker "dies": never acks. Before the timeout nothing happens.
        assert_eq!(queue.sweep(Environment::Staging), 0);
        clock.advance(Duration::from_secs(601));
        assert_eq!(queue.sweep(Environment::Staging), 1);

        let recovered = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(recovered.envelope_id, entry.envelope_id);
        // Crash recovery is not a retry.
        assert_eq!(recovered.job.retry_count, 0);
    }

    #[tokio::test]
    async fn ack_clears_processing() {
        let (_, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(queue.processing_count(Environment::Staging), 1);
        queue.ack(Environment::Staging, entry.envelope_id).unwrap();
        assert_eq!(queue.processing_count(Environment::Staging), 0);
        assert_eq!(queue.depth(Environment::Staging), 0);
    }

    #[tokio::test]
    async fn defer_spends_no_retries() {
        let (clock, queue) = queue();
        queue.push(job(Environment::Staging, 0));
        let owner = OwnerToken::generate();
        let entry = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();

        queue
            .defer(Environment::Staging, entry.envelope_id, Duration::from_secs(30))
            .unwrap();
        clock.advance(Duration::from_secs(31));
        let back = queue.pop(Environment::Staging, owner, BLOCK).await.unwrap();
        assert_eq!(back.job.retry_count, 0);
        assert_eq!(back.job.triggered_by, TriggeredBy::Cli);
    }
}
