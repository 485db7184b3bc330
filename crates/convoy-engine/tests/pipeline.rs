//! End-to-end pipeline scenarios over in-memory ports.
//!
//! Each test wires a full orchestrator with scripted fakes and drives
//! real workers; assertions run against the store the audit gateway
//! wrote through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use convoy_engine::{ConvoyConfig, Orchestrator};
use convoy_lock::InMemoryLockBackend;
use convoy_ports::fakes::{FakeExecutor, ScriptedProber, StubBuilder, StubScanner, StubVcs};
use convoy_ports::{InMemoryStore, ScanError, Store, SystemClock};
use convoy_rollout::CanaryStage;
use convoy_types::{
    DeploymentId, DeploymentJob, DeploymentRecord, DeploymentStatus, EnvVar, Environment,
    EventPayload, FailureKind, InstanceId, JobId, Phase, PhaseStatus, ScanPolicy, Strategy,
    TriggeredBy, VulnerabilityCounts, WindowConfig,
};

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<InMemoryStore>,
    vcs: Arc<StubVcs>,
    scanner: Arc<StubScanner>,
    executor: Arc<FakeExecutor>,
    prober: Arc<ScriptedProber>,
}

fn test_config() -> ConvoyConfig {
    let mut config = ConvoyConfig::default();
    config.queue.visibility_timeout = Duration::from_millis(200);
    config.queue.backoff_base = Duration::from_millis(5);
    config.lock.ttl = Duration::from_millis(500);
    config.build.retry_backoff = Duration::from_millis(1);
    config.deploy.window = WindowConfig {
        interval: Duration::from_millis(1),
        samples: 12,
        min_success: 10,
        max_consecutive_failures: 3,
        probe_timeout: Duration::from_millis(50),
    };
    config.canary.stages = vec![
        CanaryStage {
            weight: 10,
            duration: Duration::from_millis(20),
        },
        CanaryStage {
            weight: 50,
            duration: Duration::from_millis(20),
        },
    ];
    config.canary.probe_interval = Duration::from_millis(2);
    config.timeouts.security = Duration::from_secs(5);
    config.timeouts.build = Duration::from_secs(5);
    config.timeouts.deploy = Duration::from_secs(10);
    config.timeouts.cancel_grace = Duration::from_secs(1);
    config
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(scanner: StubScanner, config: ConvoyConfig) -> Harness {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let vcs = Arc::new(StubVcs::new("deadbeefcafe1234"));
    let scanner = Arc::new(scanner);
    let builder = Arc::new(StubBuilder::new());
    let executor = Arc::new(FakeExecutor::new());
    let prober = Arc::new(ScriptedProber::healthy());
    let clock = Arc::new(SystemClock);
    let lock_backend = Arc::new(InMemoryLockBackend::new(clock.clone()));

    let orchestrator = Orchestrator::new(
        vcs.clone(),
        scanner.clone(),
        builder.clone(),
        executor.clone(),
        prober.clone(),
        store.clone(),
        lock_backend,
        clock,
        config,
    );
    Harness {
        orchestrator,
        store,
        vcs,
        scanner,
        executor,
        prober,
    }
}

impl Harness {
    fn start(&self, environment: Environment, workers: usize) {
        self.orchestrator.start_workers(environment, workers);
        self.orchestrator.start_sweeper();
    }

    async fn await_terminal(&self, id: DeploymentId, timeout: Duration) -> DeploymentRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(record)) = self.store.get_record(id).await {
                if record.status.is_terminal() {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {id} did not reach a terminal status in {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn await_status(&self, id: DeploymentId, status: DeploymentStatus, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(record)) = self.store.get_record(id).await {
                if record.status == status {
                    return;
                }
                assert!(
                    !record.status.is_terminal(),
                    "deployment {id} finished as {} before reaching {status}",
                    record.status
                );
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {id} never reached {status}"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Seed a completed deployment so the next rollout has something to
    /// roll back to.
    async fn seed_deployed(&self, instance: &str, image_tag: &str) {
        let mut record = DeploymentRecord::new(
            DeploymentId::generate(),
            JobId::generate(),
            InstanceId::parse(instance).unwrap(),
            Environment::Production,
            Strategy::Rolling,
            Utc::now(),
        );
        record.status = DeploymentStatus::Deployed;
        record.current_image_tag = Some(image_tag.to_string());
        record.completed_at = Some(Utc::now());
        self.store.put_record(&record).await.unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

fn job(repository: &str, instance: &str, strategy: Strategy) -> DeploymentJob {
    DeploymentJob {
        job_id: JobId::generate(),
        deployment_id: None,
        repository: repository.to_string(),
        git_ref: "main".into(),
        commit_sha: None,
        instance_id: InstanceId::parse(instance).unwrap(),
        environment: Environment::Production,
        strategy,
        port: 8080,
        health_path: "/health".into(),
        env_vars: vec![],
        priority: 0,
        submitted_at: Utc::now(),
        triggered_by: TriggeredBy::Cli,
        retry_count: 0,
    }
}

const LONG: Duration = Duration::from_secs(10);

#[tokio::test]
async fn s1_happy_rolling_deploys_and_verifies() {
    let h = harness(StubScanner::clean(), test_config());
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    let record = h.await_terminal(id, LONG).await;

    assert_eq!(record.status, DeploymentStatus::Deployed);
    assert_eq!(record.previous_image_tag, None);
    assert_eq!(record.current_image_tag.as_deref(), Some("octo-api:deadbeef"));
    assert!(record.completed_at.is_some());

    // Every phase row carries the one deployment id and succeeded.
    let phases = h.store.list_phases(id).await.unwrap();
    let expected = [Phase::Security, Phase::Build, Phase::Deploy, Phase::Verify];
    assert_eq!(phases.len(), expected.len());
    for (row, phase) in phases.iter().zip(expected) {
        assert_eq!(row.deployment_id, id);
        assert_eq!(row.phase, phase);
        assert_eq!(row.status, PhaseStatus::Succeeded, "phase {phase}");
    }
    assert!(h.store.decision(id, 1).is_some());
    assert!(h.store.artifact(id, 1).is_some());

    // Monotonic, gap-free event stream ending in the terminal status.
    let events = h.store.list_events(id, 0).await.unwrap();
    assert!(events.len() >= 30, "only {} events", events.len());
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1, "gap at index {i}");
    }
    assert!(
        matches!(
            events.last().unwrap().payload,
            EventPayload::StatusChanged {
                status: DeploymentStatus::Deployed,
                ..
            }
        ),
        "terminal StatusChanged must be the last event"
    );

    assert_eq!(h.vcs.cloned().len(), 1);
}

#[tokio::test]
async fn s2_security_reject_stops_the_pipeline() {
    let mut config = test_config();
    config.security.policy = ScanPolicy::Strict;
    let h = harness(
        StubScanner::with_counts(VulnerabilityCounts::new(1, 0, 0, 0)),
        config,
    );
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    let record = h.await_terminal(id, LONG).await;

    assert_eq!(record.status, DeploymentStatus::Rejected);
    let (kind, _) = record.failure_reason.unwrap();
    assert_eq!(kind, FailureKind::SecurityRejected);

    // No build or deploy rows, and nothing was ever built or shipped.
    let phases = h.store.list_phases(id).await.unwrap();
    assert_eq!(phases.len(), 1);
    assert_eq!(phases[0].phase, Phase::Security);
    assert!(h.executor.issued().is_empty());

    // Exactly one Rejected status event, and it closes the stream.
    let events = h.store.list_events(id, 0).await.unwrap();
    let rejected: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                e.payload,
                EventPayload::StatusChanged {
                    status: DeploymentStatus::Rejected,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].seq, events.last().unwrap().seq);
}

#[tokio::test]
async fn s3_failed_drain_rolls_back_to_previous_image() {
    let h = harness(StubScanner::clean(), test_config());
    h.seed_deployed("i-abc", "octo-api:cafefeed").await;
    // Candidate healthy on the side port; the promoted app port fails.
    h.prober.script_for(":8080", vec![Ok(500); 20]);
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    let record = h.await_terminal(id, LONG).await;

    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert_eq!(record.previous_image_tag.as_deref(), Some("octo-api:cafefeed"));
    let (kind, _) = record.failure_reason.unwrap();
    assert_eq!(kind, FailureKind::HealthFailed);
    assert!(record.rollback_reason.is_some());

    // RollbackStarted precedes the terminal status in the stream.
    let events = h.store.list_events(id, 0).await.unwrap();
    let rollback_seq = events
        .iter()
        .find(|e| matches!(e.payload, EventPayload::RollbackStarted { .. }))
        .expect("RollbackStarted event")
        .seq;
    assert!(rollback_seq < events.last().unwrap().seq);

    // The rollback script restarted the previous image.
    let restores = h.executor.scripts_containing("octo-api:cafefeed");
    assert!(!restores.is_empty());
}

#[tokio::test]
async fn s4_canary_abort_restores_upstream_verbatim() {
    let h = harness(StubScanner::clean(), test_config());
    h.seed_deployed("i-abc", "octo-api:cafefeed").await;
    // Two isolated canary failures out of 20 stage probes: 10% error
    // rate against a 5% threshold.
    let mut outcomes = vec![Ok(200)]; // pre-switch probe
    outcomes.extend([Ok(200), Ok(500), Ok(200), Ok(200), Ok(500)]);
    outcomes.extend(std::iter::repeat(Ok(200)).take(10));
    h.prober.script_for(":8081", outcomes);
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Canary))
        .await
        .unwrap();
    let record = h.await_terminal(id, LONG).await;

    assert_eq!(record.status, DeploymentStatus::RolledBack);

    // Stage zero never completed.
    let phases = h.store.list_phases(id).await.unwrap();
    let deploy_row = phases.iter().find(|r| r.phase == Phase::Deploy).unwrap();
    assert_eq!(deploy_row.status, PhaseStatus::Failed);
    assert_eq!(deploy_row.payload.as_ref().unwrap()["stages_completed"], 0);

    // The saved upstream body came back byte-for-byte and the canary
    // container was removed; promotion never happened.
    let baseline = "upstream convoy_app {\n    server 127.0.0.1:8080 weight=100;\n}\n";
    assert!(h
        .executor
        .issued()
        .iter()
        .any(|(_, _, script)| script.contains(baseline)));
    assert!(!h
        .executor
        .scripts_containing("docker rm -f app-candidate-deadbeef")
        .is_empty());
    assert!(h
        .executor
        .scripts_containing("--env-file /tmp/app-candidate-deadbeef.env -p 8080:8080")
        .is_empty());
}

#[tokio::test]
async fn s5_same_instance_deployments_serialize() {
    let h = harness(StubScanner::clean(), test_config());
    h.start(Environment::Production, 2);

    let first = h
        .orchestrator
        .submit(job("octo/api", "i-xyz", Strategy::Rolling))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h
        .orchestrator
        .submit(job("octo/web", "i-xyz", Strategy::Rolling))
        .await
        .unwrap();

    let record_a = h.await_terminal(first, LONG).await;
    let record_b = h.await_terminal(second, LONG).await;
    assert_eq!(record_a.status, DeploymentStatus::Deployed);
    assert_eq!(record_b.status, DeploymentStatus::Deployed);

    // Whichever ran second saw the first's image as its predecessor,
    // which can only happen if the runs never overlapped.
    let (pioneer, follower) = if record_a.previous_image_tag.is_none() {
        (record_a, record_b)
    } else {
        (record_b, record_a)
    };
    assert_eq!(pioneer.previous_image_tag, None);
    assert_eq!(follower.previous_image_tag, pioneer.current_image_tag);
}

#[tokio::test]
async fn s6_crashed_worker_job_is_recovered_and_finished() {
    let h = harness(StubScanner::clean(), test_config());

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();

    // A worker pops the job and dies before doing anything.
    let ghost = convoy_types::OwnerToken::generate();
    let entry = h
        .orchestrator
        .queue()
        .pop(Environment::Production, ghost, Duration::from_millis(50))
        .await
        .expect("entry should be available");
    assert_eq!(entry.job.deployment_id, Some(id));

    // Real workers come up; the sweeper must hand them the orphan after
    // the visibility timeout.
    h.start(Environment::Production, 1);
    let record = h.await_terminal(id, LONG).await;
    assert_eq!(record.status, DeploymentStatus::Deployed);

    // The image was transferred exactly once.
    assert_eq!(h.executor.scripts_containing("docker pull").len(), 1);
    assert_eq!(h.orchestrator.queue().processing_count(Environment::Production), 0);
}

#[tokio::test]
async fn redelivery_of_a_finished_deployment_is_a_no_op() {
    let h = harness(StubScanner::clean(), test_config());
    h.start(Environment::Production, 1);

    let submitted = job("octo/api", "i-abc", Strategy::Rolling);
    let id = h.orchestrator.submit(submitted.clone()).await.unwrap();
    h.await_terminal(id, LONG).await;
    let pulls_before = h.executor.scripts_containing("docker pull").len();

    // Simulate a duplicate delivery of the same job.
    let mut duplicate = submitted;
    duplicate.deployment_id = Some(id);
    let disposition = h
        .orchestrator
        .coordinator()
        .run(id, &duplicate, CancellationToken::new(), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        disposition,
        convoy_engine::RunDisposition::Terminal(DeploymentStatus::Deployed)
    ));
    assert_eq!(
        h.executor.scripts_containing("docker pull").len(),
        pulls_before,
        "no scripts re-issued for a terminal deployment"
    );
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_terminally() {
    let scanner = StubScanner::clean();
    for _ in 0..8 {
        scanner.push(Err(ScanError::ScannerFailed("oom".into())));
    }
    let h = harness(scanner, test_config());
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    let record = h.await_terminal(id, LONG).await;

    assert_eq!(record.status, DeploymentStatus::Failed);
    let (kind, detail) = record.failure_reason.unwrap();
    assert_eq!(kind, FailureKind::ScannerError);
    assert!(detail.contains("retry budget exhausted"));

    // The terminal event closes the stream.
    let events = h.store.list_events(id, 0).await.unwrap();
    assert!(matches!(
        events.last().unwrap().payload,
        EventPayload::StatusChanged {
            status: DeploymentStatus::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn cancellation_mid_deploy_rolls_back_and_cancels() {
    let mut config = test_config();
    // Slow the windows down so the cancel lands mid-deploy.
    config.deploy.window.interval = Duration::from_millis(20);
    let h = harness(StubScanner::clean(), config);
    h.seed_deployed("i-abc", "octo-api:cafefeed").await;
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    h.await_status(id, DeploymentStatus::Deploying, LONG).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.orchestrator.cancel(id);

    let record = h.await_terminal(id, LONG).await;
    assert_eq!(record.status, DeploymentStatus::Cancelled);

    let events = h.store.list_events(id, 0).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::RollbackStarted { .. })),
        "cancel past StartingNew must roll back first"
    );
}

#[tokio::test]
async fn secrets_never_reach_rows_or_events() {
    let h = harness(StubScanner::clean(), test_config());
    // A build log line leaks the secret; the gateway must scrub it.
    let mut builder = StubBuilder::new();
    builder.log_lines = vec![
        "Step 1/4 : FROM python:3.12-slim".into(),
        "connecting with hunter2-secret-value".into(),
    ];
    // Rebuild the harness with the leaky builder.
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SystemClock);
    let orchestrator = Orchestrator::new(
        h.vcs.clone(),
        h.scanner.clone(),
        Arc::new(builder),
        h.executor.clone(),
        h.prober.clone(),
        store.clone(),
        Arc::new(InMemoryLockBackend::new(clock.clone())),
        clock,
        test_config(),
    );
    orchestrator.start_workers(Environment::Production, 1);

    let mut submitted = job("octo/api", "i-abc", Strategy::Rolling);
    submitted.env_vars = vec![
        EnvVar::new("PORT", "8080"),
        EnvVar::secret("DB_PASSWORD", "hunter2-secret-value"),
    ];
    let id = orchestrator.submit(submitted).await.unwrap();

    let deadline = tokio::time::Instant::now() + LONG;
    let record = loop {
        if let Ok(Some(record)) = store.get_record(id).await {
            if record.status.is_terminal() {
                break record;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "never finished");
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    assert_eq!(record.status, DeploymentStatus::Deployed);

    let events = store.list_events(id, 0).await.unwrap();
    let serialized = serde_json::to_string(&events).unwrap();
    assert!(
        !serialized.contains("hunter2-secret-value"),
        "secret leaked into the event trail"
    );
    let phases = serde_json::to_string(&store.list_phases(id).await.unwrap()).unwrap();
    assert!(!phases.contains("hunter2-secret-value"));
    orchestrator.shutdown();
}

#[tokio::test]
async fn subscribers_get_a_snapshot_then_gap_free_events() {
    let h = harness(StubScanner::clean(), test_config());
    h.start(Environment::Production, 1);

    let id = h
        .orchestrator
        .submit(job("octo/api", "i-abc", Strategy::Rolling))
        .await
        .unwrap();
    // Subscribe as soon as the record exists.
    let deadline = tokio::time::Instant::now() + LONG;
    while h.store.get_record(id).await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "record never appeared");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut stream = h.orchestrator.subscribe(id).await.unwrap();
    let first = stream.recv().await.unwrap();
    let snapshot_seq = first.seq;
    let EventPayload::Snapshot { record } = first.payload else {
        panic!("stream must open with a snapshot");
    };
    assert_eq!(record.deployment_id, id);
    if record.status.is_terminal() {
        // The pipeline outran the subscription; the snapshot already
        // tells the whole story.
        return;
    }

    let mut last_seq = snapshot_seq;
    loop {
        let event = tokio::time::timeout(LONG, stream.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed early");
        assert_eq!(event.seq, last_seq + 1, "gap after {last_seq}");
        last_seq = event.seq;
        if event.payload.is_terminal() {
            break;
        }
    }
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let h = harness(StubScanner::clean(), test_config());

    let mut first = job("octo/api", "i-abc", Strategy::Rolling);
    first.deployment_id = Some(DeploymentId::generate());
    let id = h.orchestrator.submit(first.clone()).await.unwrap();
    assert_eq!(Some(id), first.deployment_id);

    // While live (still queued), resubmission returns the same id.
    h.start(Environment::Production, 1);
    h.await_terminal(id, LONG).await;

    // Once terminal, the same id is rejected as a duplicate.
    let err = h.orchestrator.submit(first).await.unwrap_err();
    assert!(matches!(
        err,
        convoy_engine::EngineError::DuplicateDeployment(_)
    ));
}
