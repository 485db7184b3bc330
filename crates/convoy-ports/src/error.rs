//! Port error vocabularies

use thiserror::Error;

/// Version-control failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VcsError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("authentication denied for {0}")]
    AuthDenied(String),

    #[error("repository or ref not found: {0}")]
    NotFound(String),

    #[error("target directory is not empty: {0}")]
    DirtyTarget(String),
}

impl VcsError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VcsError::Unreachable(_))
    }
}

/// Scanner failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("scan timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("scanner failed: {0}")]
    ScannerFailed(String),

    #[error("nothing to scan at {0}")]
    EmptyTarget(String),
}

/// Container build failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("base image pull failed: {0}")]
    BaseImagePull(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("detection failed: {0}")]
    DetectionFailed(String),
}

impl BuildError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::BaseImagePull(_))
    }
}

/// Remote execution failures. A non-zero exit code is not an error at
/// this level; it comes back in [`crate::ExecOutput`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Probe transport failures. HTTP error statuses are not transport
/// failures; they come back in the sample.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("probe timed out")]
    Timeout,
}

/// Persistence failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("write to terminal deployment {0} rejected")]
    TerminalImmutable(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
