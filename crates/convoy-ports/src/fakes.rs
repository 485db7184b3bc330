//! Scripted port fakes
//!
//! Deterministic implementations of the capability ports, used by the
//! pipeline's own tests and by embedders writing theirs. Each fake
//! records what it was asked to do and replays scripted outcomes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use convoy_types::{
    BuildArtifact, CommandId, DeploymentEvent, DeploymentId, DetectionResult,
    DockerfileProvenance, EventPayload, HealthSample, InstanceId, ScanPolicy, ScanReport,
    VulnerabilityCounts,
};

use crate::builder::{ContainerBuilder, LogSink};
use crate::error::{BuildError, ProbeError, ScanError, StoreError, VcsError};
use crate::executor::{ExecOutput, RemoteExecutor};
use crate::prober::HealthProber;
use crate::scanner::ImageScanner;
use crate::sink::EventSink;
use crate::vcs::{CloneOutcome, Vcs};

/// Clones by writing a canned worktree to the target directory.
pub struct StubVcs {
    sha: String,
    /// Produce an empty worktree, for the empty-repo edge case.
    pub empty: bool,
    fail_next: Mutex<Option<VcsError>>,
    cloned: Mutex<Vec<(String, String)>>,
}

impl StubVcs {
    pub fn new(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            empty: false,
            fail_next: Mutex::new(None),
            cloned: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, error: VcsError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// `(repository, ref)` pairs cloned so far.
    pub fn cloned(&self) -> Vec<(String, String)> {
        self.cloned.lock().unwrap().clone()
    }
}

#[async_trait]
impl Vcs for StubVcs {
    async fn clone_repo(
        &self,
        repository: &str,
        git_ref: &str,
        target_dir: &Path,
    ) -> Result<CloneOutcome, VcsError> {
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        if target_dir.exists() && std::fs::read_dir(target_dir).map(|mut d| d.next().is_some()).unwrap_or(false) {
            return Err(VcsError::DirtyTarget(target_dir.display().to_string()));
        }
        std::fs::create_dir_all(target_dir)
            .map_err(|e| VcsError::Unreachable(e.to_string()))?;
        if !self.empty {
            std::fs::write(target_dir.join("main.py"), "print('ok')\n")
                .map_err(|e| VcsError::Unreachable(e.to_string()))?;
        }
        self.cloned
            .lock()
            .unwrap()
            .push((repository.to_string(), git_ref.to_string()));
        Ok(CloneOutcome {
            resolved_sha: self.sha.clone(),
            worktree_path: target_dir.to_path_buf(),
        })
    }

    async fn resolve_sha(&self, _repository: &str, _git_ref: &str) -> Result<String, VcsError> {
        Ok(self.sha.clone())
    }
}

/// Replays a queue of scan outcomes; defaults to a clean report.
pub struct StubScanner {
    outcomes: Mutex<VecDeque<Result<ScanReport, ScanError>>>,
}

impl StubScanner {
    pub fn clean() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_counts(counts: VulnerabilityCounts) -> Self {
        let scanner = Self::clean();
        scanner.push(Ok(ScanReport {
            counts,
            complete: true,
            scanner_version: "stub-1".into(),
        }));
        scanner
    }

    pub fn push(&self, outcome: Result<ScanReport, ScanError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn next(&self) -> Result<ScanReport, ScanError> {
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(ScanReport {
            counts: VulnerabilityCounts::default(),
            complete: true,
            scanner_version: "stub-1".into(),
        }))
    }
}

#[async_trait]
impl ImageScanner for StubScanner {
    async fn scan_filesystem(
        &self,
        _path: &Path,
        _policy: ScanPolicy,
        _skip_globs: &[String],
        _timeout: Duration,
    ) -> Result<ScanReport, ScanError> {
        self.next()
    }

    async fn scan_image(
        &self,
        _image_ref: &str,
        _policy: ScanPolicy,
        _timeout: Duration,
    ) -> Result<ScanReport, ScanError> {
        self.next()
    }
}

/// Produces a canned artifact, optionally failing the first N builds with
/// a base-image pull flake.
pub struct StubBuilder {
    pub detection: DetectionResult,
    pub log_lines: Vec<String>,
    pub size_bytes: u64,
    fail_pulls: AtomicU32,
}

impl StubBuilder {
    pub fn new() -> Self {
        Self {
            detection: DetectionResult {
                language: "python".into(),
                framework: Some("flask".into()),
                entrypoint: Some("main.py".into()),
                has_dockerfile: false,
            },
            log_lines: vec!["Step 1/4 : FROM python:3.12-slim".into(), "Successfully built".into()],
            size_bytes: 150 * 1024 * 1024,
            fail_pulls: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` builds with `BaseImagePull`.
    pub fn fail_pulls(&self, n: u32) {
        self.fail_pulls.store(n, Ordering::SeqCst);
    }
}

impl Default for StubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBuilder for StubBuilder {
    async fn detect(&self, _worktree: &Path) -> Result<DetectionResult, BuildError> {
        Ok(self.detection.clone())
    }

    fn generate_dockerfile(&self, detection: &DetectionResult) -> String {
        format!("FROM {}:latest\nCOPY . /app\n", detection.language)
    }

    async fn build(
        &self,
        _context_dir: &Path,
        image_tag: &str,
        dockerfile: Option<&str>,
        logs: LogSink,
    ) -> Result<BuildArtifact, BuildError> {
        if self
            .fail_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BuildError::BaseImagePull("registry timeout".into()));
        }
        for line in &self.log_lines {
            logs(line.clone());
        }
        Ok(BuildArtifact {
            image_tag: image_tag.to_string(),
            image_digest: "sha256:stub".into(),
            size_bytes: self.size_bytes,
            base_image: format!("{}:latest", self.detection.language),
            detected_language: self.detection.language.clone(),
            detected_framework: self.detection.framework.clone(),
            dockerfile_provenance: if dockerfile.is_some() {
                DockerfileProvenance::Generated
            } else {
                DockerfileProvenance::Repository
            },
            layers: 4,
            build_duration: Duration::from_secs(30),
        })
    }
}

/// Records every issued script and replays outcomes at most once per
/// command id, matching the real executor's dedup contract.
#[derive(Default)]
pub struct FakeExecutor {
    executed: DashMap<CommandId, ExecOutput>,
    issued: Mutex<Vec<(InstanceId, CommandId, String)>>,
    fail_matching: Mutex<Vec<(String, i32)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts containing `needle` exit with `code` instead of 0.
    pub fn fail_scripts_containing(&self, needle: impl Into<String>, code: i32) {
        self.fail_matching.lock().unwrap().push((needle.into(), code));
    }

    /// Every `(instance, command_id, script)` actually executed, in order.
    pub fn issued(&self) -> Vec<(InstanceId, CommandId, String)> {
        self.issued.lock().unwrap().clone()
    }

    /// Scripts whose text contains `needle`.
    pub fn scripts_containing(&self, needle: &str) -> Vec<String> {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, s)| s.contains(needle))
            .map(|(_, _, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        instance_id: &InstanceId,
        command_id: &CommandId,
        script: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, crate::error::ExecError> {
        // At-most-once per command id: replay without re-recording.
        if let Some(output) = self.executed.get(command_id) {
            return Ok(output.clone());
        }
        let exit_code = self
            .fail_matching
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| script.contains(needle))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        let output = ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "injected failure".into()
            },
        };
        self.executed.insert(command_id.clone(), output.clone());
        self.issued.lock().unwrap().push((
            instance_id.clone(),
            command_id.clone(),
            script.to_string(),
        ));
        Ok(output)
    }
}

/// One scripted probe outcome.
pub type ProbeOutcome = Result<u16, ProbeError>;

/// Replays probe outcomes, optionally keyed by a URL substring. Falls
/// back to 200 OK when nothing is scripted.
#[derive(Default)]
pub struct ScriptedProber {
    by_url: Mutex<Vec<(String, VecDeque<ProbeOutcome>)>>,
    default_queue: Mutex<VecDeque<ProbeOutcome>>,
}

impl ScriptedProber {
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Queue outcomes for probes whose URL contains `needle`.
    pub fn script_for(&self, needle: impl Into<String>, outcomes: Vec<ProbeOutcome>) {
        self.by_url
            .lock()
            .unwrap()
            .push((needle.into(), outcomes.into()));
    }

    /// Queue outcomes for any probe, regardless of URL.
    pub fn script(&self, outcomes: Vec<ProbeOutcome>) {
        self.default_queue.lock().unwrap().extend(outcomes);
    }

    fn next(&self, url: &str) -> ProbeOutcome {
        let mut by_url = self.by_url.lock().unwrap();
        for (needle, queue) in by_url.iter_mut() {
            if url.contains(needle.as_str()) {
                if let Some(outcome) = queue.pop_front() {
                    return outcome;
                }
            }
        }
        self.default_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(200))
    }
}

#[async_trait]
impl HealthProber for ScriptedProber {
    async fn probe(
        &self,
        url: &str,
        _timeout: Duration,
        attempt: u32,
    ) -> Result<HealthSample, ProbeError> {
        match self.next(url) {
            Ok(status) => Ok(HealthSample::ok(attempt, status, 5, chrono::Utc::now())),
            Err(e) => Err(e),
        }
    }
}

/// Collects published events for assertions, sequencing them the way the
/// real bus does.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DeploymentEvent>>,
    seqs: DashMap<DeploymentId, u64>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeploymentEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Payload kinds in publish order, for terse assertions.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.payload.kind()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(
        &self,
        deployment_id: DeploymentId,
        payload: EventPayload,
    ) -> Result<u64, StoreError> {
        let mut seq_ref = self.seqs.entry(deployment_id).or_insert(0);
        *seq_ref += 1;
        let seq = *seq_ref;
        drop(seq_ref);
        self.events.lock().unwrap().push(DeploymentEvent {
            deployment_id,
            seq,
            timestamp: chrono::Utc::now(),
            payload,
        });
        Ok(seq)
    }
}
