//! Container-builder port

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use convoy_types::{BuildArtifact, DetectionResult};

use crate::error::BuildError;

/// Receives build output lines as they are produced. The build phase
/// wraps this with rate capping before events are published.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

/// Container image production.
#[async_trait]
pub trait ContainerBuilder: Send + Sync {
    /// Inspect a worktree: language, framework, entrypoint, and whether
    /// it ships its own Dockerfile.
    async fn detect(&self, worktree: &Path) -> Result<DetectionResult, BuildError>;

    /// Generate a Dockerfile for a worktree with none of its own.
    fn generate_dockerfile(&self, detection: &DetectionResult) -> String;

    /// Build `context_dir` into `image_tag`, streaming progress lines to
    /// `logs`. `dockerfile` overrides the context's own file when given.
    async fn build(
        &self,
        context_dir: &Path,
        image_tag: &str,
        dockerfile: Option<&str>,
        logs: LogSink,
    ) -> Result<BuildArtifact, BuildError>;
}
