//! Build phase
//!
//! Detect the worktree, synthesize a Dockerfile and ignore file when the
//! repository ships none, derive the image tag from the resolved sha,
//! and build while streaming rate-capped log lines. Base-image pull
//! flakes retry with a short backoff; anything else is terminal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use convoy_ports::{BuildError, ContainerBuilder};
use convoy_types::{
    build::{image_tag_for, validate_image_tag},
    BuildArtifact, DeploymentId, DeploymentJob, DetectionResult, FailureKind, Phase,
};

use crate::logs::LogStream;
use crate::recorder::PhaseRecorder;
use crate::result::PhaseResult;

/// Build-phase tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Extra attempts after a base-image pull flake.
    pub base_image_retries: u32,
    /// Backoff between those attempts.
    #[serde(with = "convoy_types::duration_millis")]
    pub retry_backoff: Duration,
    /// LogLine events per second before merging into a tail summary.
    pub max_log_lines_per_sec: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_image_retries: 2,
            retry_backoff: Duration::from_secs(15),
            max_log_lines_per_sec: 200,
        }
    }
}

pub struct BuildPhase {
    builder: Arc<dyn ContainerBuilder>,
    recorder: Arc<PhaseRecorder>,
    config: BuildConfig,
}

impl BuildPhase {
    pub fn new(
        builder: Arc<dyn ContainerBuilder>,
        recorder: Arc<PhaseRecorder>,
        config: BuildConfig,
    ) -> Self {
        Self {
            builder,
            recorder,
            config,
        }
    }

    #[instrument(skip(self, job, worktree), fields(deployment_id = %deployment_id))]
    pub async fn run(
        &self,
        deployment_id: DeploymentId,
        job: &DeploymentJob,
        worktree: &Path,
        resolved_sha: &str,
        attempt: u32,
    ) -> Result<PhaseResult<BuildArtifact>, convoy_audit::AuditError> {
        let entry = self
            .recorder
            .enter(deployment_id, Phase::Build, attempt)
            .await?;

        let result = self
            .execute(deployment_id, job, worktree, resolved_sha)
            .await;
        match &result {
            PhaseResult::Ok(artifact) => {
                self.recorder
                    .audit()
                    .artifact(deployment_id, attempt, artifact)
                    .await?;
                let payload = serde_json::json!({
                    "image_tag": artifact.image_tag,
                    "image_digest": artifact.image_digest,
                    "size_bytes": artifact.size_bytes,
                });
                self.recorder.succeed(entry, Some(payload)).await?;
            }
            PhaseResult::Skipped { reason } => {
                info!(reason, "build phase skipped");
                self.recorder.succeed(entry, None).await?;
            }
            PhaseResult::Failed(failure) => {
                self.recorder.fail(entry, failure, None).await?;
            }
        }
        Ok(result)
    }

    async fn execute(
        &self,
        deployment_id: DeploymentId,
        job: &DeploymentJob,
        worktree: &Path,
        resolved_sha: &str,
    ) -> PhaseResult<BuildArtifact> {
        let detection = match self.builder.detect(worktree).await {
            Ok(detection) => detection,
            Err(e) => {
                return PhaseResult::failed(FailureKind::BuildFailed, e.to_string(), false)
            }
        };
        info!(
            language = %detection.language,
            framework = detection.framework.as_deref().unwrap_or("-"),
            has_dockerfile = detection.has_dockerfile,
            "worktree detected"
        );

        let generated = if detection.has_dockerfile {
            None
        } else {
            let dockerfile = self.builder.generate_dockerfile(&detection);
            if let Err(e) = std::fs::write(worktree.join("Dockerfile"), &dockerfile) {
                return PhaseResult::failed(
                    FailureKind::Infrastructure,
                    format!("writing Dockerfile: {e}"),
                    true,
                );
            }
            let ignore = ignore_defaults(&detection);
            if let Err(e) = std::fs::write(worktree.join(".dockerignore"), ignore) {
                return PhaseResult::failed(
                    FailureKind::Infrastructure,
                    format!("writing .dockerignore: {e}"),
                    true,
                );
            }
            Some(dockerfile)
        };

        let image_tag = image_tag_for(&job.repository, resolved_sha);
        if let Err(e) = validate_image_tag(&image_tag) {
            return PhaseResult::failed(FailureKind::Input, e.to_string(), false);
        }

        let mut pulls_left = self.config.base_image_retries;
        loop {
            let stream = LogStream::start(
                self.recorder.events().clone(),
                deployment_id,
                self.config.max_log_lines_per_sec,
            );
            let outcome = self
                .builder
                .build(worktree, &image_tag, generated.as_deref(), stream.sink())
                .await;
            stream.finish().await;

            match outcome {
                Ok(artifact) => {
                    info!(
                        image_tag = %artifact.image_tag,
                        size_bytes = artifact.size_bytes,
                        "image built"
                    );
                    return PhaseResult::Ok(artifact);
                }
                Err(BuildError::BaseImagePull(detail)) if pulls_left > 0 => {
                    pulls_left -= 1;
                    warn!(detail = %detail, pulls_left, "base image pull flaked, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(BuildError::BaseImagePull(detail)) => {
                    return PhaseResult::failed(FailureKind::BaseImagePull, detail, true);
                }
                Err(e) => {
                    return PhaseResult::failed(FailureKind::BuildFailed, e.to_string(), false);
                }
            }
        }
    }
}

/// Language-appropriate ignore defaults written next to a generated
/// Dockerfile.
fn ignore_defaults(detection: &DetectionResult) -> String {
    let mut lines: Vec<&str> = vec![".git", ".gitignore", "Dockerfile", "*.md"];
    match detection.language.as_str() {
        "python" => lines.extend(["__pycache__", "*.pyc", ".venv", ".pytest_cache"]),
        "node" | "javascript" | "typescript" => {
            lines.extend(["node_modules", "npm-debug.log", ".next", "dist"])
        }
        "rust" => lines.extend(["target"]),
        "go" => lines.extend(["bin", "*.test"]),
        _ => {}
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_audit::{AuditGateway, Redactor};
    use convoy_ports::fakes::{RecordingSink, StubBuilder};
    use convoy_ports::{InMemoryStore, SystemClock};
    use convoy_types::{
        DockerfileProvenance, Environment, InstanceId, JobId, Strategy, TriggeredBy,
    };

    fn job() -> DeploymentJob {
        DeploymentJob {
            job_id: JobId::generate(),
            deployment_id: None,
            repository: "octo/api".into(),
            git_ref: "main".into(),
            commit_sha: None,
            instance_id: InstanceId::parse("i-abc").unwrap(),
            environment: Environment::Production,
            strategy: Strategy::Rolling,
            port: 8080,
            health_path: "/health".into(),
            env_vars: vec![],
            priority: 0,
            submitted_at: Utc::now(),
            triggered_by: TriggeredBy::Cli,
            retry_count: 0,
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        sink: Arc<RecordingSink>,
        phase: BuildPhase,
        worktree: tempfile::TempDir,
    }

    fn harness(builder: StubBuilder, config: BuildConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(AuditGateway::new(store.clone(), Arc::new(Redactor::new())));
        let sink = Arc::new(RecordingSink::new());
        let recorder = Arc::new(PhaseRecorder::new(audit, sink.clone(), Arc::new(SystemClock)));
        let phase = BuildPhase::new(Arc::new(builder), recorder, config);
        let worktree = tempfile::TempDir::new().unwrap();
        std::fs::write(worktree.path().join("main.py"), "print('ok')\n").unwrap();
        Harness {
            store,
            sink,
            phase,
            worktree,
        }
    }

    #[tokio::test]
    async fn builds_and_tags_from_the_sha() {
        let h = harness(StubBuilder::new(), BuildConfig::default());
        let id = DeploymentId::generate();
        let result = h
            .phase
            .run(id, &job(), h.worktree.path(), "deadbeefcafe", 1)
            .await
            .unwrap();

        let PhaseResult::Ok(artifact) = result else {
            panic!("expected artifact");
        };
        assert_eq!(artifact.image_tag, "octo-api:deadbeef");
        assert!(h.store.artifact(id, 1).is_some());
    }

    #[tokio::test]
    async fn generates_dockerfile_and_ignore_when_missing() {
        let h = harness(StubBuilder::new(), BuildConfig::default());
        let result = h
            .phase
            .run(DeploymentId::generate(), &job(), h.worktree.path(), "deadbeef", 1)
            .await
            .unwrap();

        let PhaseResult::Ok(artifact) = result else {
            panic!("expected artifact");
        };
        assert_eq!(artifact.dockerfile_provenance, DockerfileProvenance::Generated);
        assert!(h.worktree.path().join("Dockerfile").exists());
        let ignore = std::fs::read_to_string(h.worktree.path().join(".dockerignore")).unwrap();
        assert!(ignore.contains("__pycache__"));
    }

    #[tokio::test]
    async fn pull_flakes_retry_then_succeed() {
        let builder = StubBuilder::new();
        builder.fail_pulls(2);
        let h = harness(
            builder,
            BuildConfig {
                retry_backoff: Duration::from_millis(1),
                ..BuildConfig::default()
            },
        );
        let result = h
            .phase
            .run(DeploymentId::generate(), &job(), h.worktree.path(), "deadbeef", 1)
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn pull_flakes_beyond_budget_fail_retryably() {
        let builder = StubBuilder::new();
        builder.fail_pulls(5);
        let h = harness(
            builder,
            BuildConfig {
                retry_backoff: Duration::from_millis(1),
                ..BuildConfig::default()
            },
        );
        let result = h
            .phase
            .run(DeploymentId::generate(), &job(), h.worktree.path(), "deadbeef", 1)
            .await
            .unwrap();
        let PhaseResult::Failed(failure) = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::BaseImagePull);
        assert!(failure.retryable);
    }

    #[tokio::test]
    async fn build_logs_become_events() {
        let h = harness(StubBuilder::new(), BuildConfig::default());
        h.phase
            .run(DeploymentId::generate(), &job(), h.worktree.path(), "deadbeef", 1)
            .await
            .unwrap();
        let lines: Vec<String> = h
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e.payload {
                convoy_types::EventPayload::LogLine { line } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("FROM python"));
    }
}
