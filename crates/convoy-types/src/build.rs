//! Build outputs and the image-tag grammar

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ValidationError;

/// Where the Dockerfile used for a build came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerfileProvenance {
    /// The repository shipped its own Dockerfile.
    Repository,
    /// Convoy generated one from the detected language and framework.
    Generated,
}

/// What the builder learned about a worktree before building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub language: String,
    pub framework: Option<String>,
    pub entrypoint: Option<String>,
    pub has_dockerfile: bool,
}

/// The container image a successful build produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// `name:tag`, validated against the tag grammar.
    pub image_tag: String,
    pub image_digest: String,
    pub size_bytes: u64,
    pub base_image: String,
    pub detected_language: String,
    pub detected_framework: Option<String>,
    pub dockerfile_provenance: DockerfileProvenance,
    pub layers: u32,
    #[serde(with = "crate::duration_millis")]
    pub build_duration: Duration,
}

/// Validate a full `name:tag` reference.
///
/// Grammar: both sides `[a-z0-9._-]+`, exactly one colon, 128 chars max
/// overall.
pub fn validate_image_tag(tag: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidImageTag(tag.to_string());
    if tag.len() > 128 {
        return Err(invalid());
    }
    let (name, version) = tag.split_once(':').ok_or_else(invalid)?;
    if version.contains(':') {
        return Err(invalid());
    }
    for part in [name, version] {
        if part.is_empty()
            || !part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Sanitize an `owner/name` repository into a legal image name.
pub fn sanitize_repo(repository: &str) -> String {
    let mut out = String::with_capacity(repository.len());
    for c in repository.chars() {
        match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => out.push(c),
            'A'..='Z' => out.push(c.to_ascii_lowercase()),
            _ => out.push('-'),
        }
    }
    // Leading separators are illegal in image names.
    out.trim_start_matches(['.', '-', '_']).to_string()
}

/// The tag for a build: `<sanitized_repo>:<first-8-of-sha>`.
pub fn image_tag_for(repository: &str, commit_sha: &str) -> String {
    let short = &commit_sha[..commit_sha.len().min(8)];
    format!("{}:{}", sanitize_repo(repository), short.to_ascii_lowercase())
}
