//! Vulnerability-scanner port

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use convoy_types::{ScanPolicy, ScanReport};

use crate::error::ScanError;

/// Static vulnerability scanning. Deterministic for a given input and
/// vulnerability-DB snapshot; the timeout is mandatory.
#[async_trait]
pub trait ImageScanner: Send + Sync {
    /// Scan a checked-out worktree. `skip_globs` prunes dependency
    /// caches, vendored trees, and VCS metadata before scanning.
    async fn scan_filesystem(
        &self,
        path: &Path,
        policy: ScanPolicy,
        skip_globs: &[String],
        timeout: Duration,
    ) -> Result<ScanReport, ScanError>;

    /// Scan a built image by reference.
    async fn scan_image(
        &self,
        image_ref: &str,
        policy: ScanPolicy,
        timeout: Duration,
    ) -> Result<ScanReport, ScanError>;
}
