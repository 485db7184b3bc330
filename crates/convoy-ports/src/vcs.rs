//! Version-control port

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::VcsError;

/// Result of a clone: the sha the ref resolved to and where the worktree
/// landed.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub resolved_sha: String,
    pub worktree_path: PathBuf,
}

/// Source-control access. One repository at one ref into one directory.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `repository` at `git_ref` into `target_dir`. The directory
    /// must be empty; a populated target fails with `DirtyTarget`.
    async fn clone_repo(
        &self,
        repository: &str,
        git_ref: &str,
        target_dir: &Path,
    ) -> Result<CloneOutcome, VcsError>;

    /// Resolve a ref to a commit sha without cloning.
    async fn resolve_sha(&self, repository: &str, git_ref: &str) -> Result<String, VcsError>;
}
