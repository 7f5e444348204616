//! Object key hierarchy.
//!
//! All job artifacts live under a fixed hierarchy so a prefix listing
//! recovers everything for a project or job without an index:
//!
//! ```text
//! {namespace}/{owner}/{project}/{kind}/{job-or-stage}/{filename}
//! ```

use crate::error::{StorageError, StorageResult};

/// Top-level namespace for all media artifacts.
pub const NAMESPACE: &str = "media";

/// Artifact kind segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Generated or uploaded source clips
    Clips,
    /// Final stitched outputs
    Outputs,
    /// Intermediate stage artifacts
    Stages,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Clips => "clips",
            ArtifactKind::Outputs => "outputs",
            ArtifactKind::Stages => "stages",
        }
    }
}

/// Build an object key for a job artifact.
pub fn artifact_key(
    owner_id: &str,
    project_id: &str,
    kind: ArtifactKind,
    job_or_stage: &str,
    filename: &str,
) -> StorageResult<String> {
    for (label, segment) in [
        ("owner", owner_id),
        ("project", project_id),
        ("job", job_or_stage),
        ("filename", filename),
    ] {
        validate_segment(label, segment)?;
    }

    Ok(format!(
        "{}/{}/{}/{}/{}/{}",
        NAMESPACE,
        owner_id,
        project_id,
        kind.as_str(),
        job_or_stage,
        filename
    ))
}

/// Key for a generated clip.
pub fn clip_key(
    owner_id: &str,
    project_id: &str,
    job_id: &str,
    filename: &str,
) -> StorageResult<String> {
    artifact_key(owner_id, project_id, ArtifactKind::Clips, job_id, filename)
}

/// Key for a stitched output.
pub fn output_key(
    owner_id: &str,
    project_id: &str,
    job_id: &str,
    filename: &str,
) -> StorageResult<String> {
    artifact_key(owner_id, project_id, ArtifactKind::Outputs, job_id, filename)
}

/// Key for an intermediate stage artifact.
pub fn stage_key(
    owner_id: &str,
    project_id: &str,
    stage: &str,
    filename: &str,
) -> StorageResult<String> {
    artifact_key(owner_id, project_id, ArtifactKind::Stages, stage, filename)
}

/// Prefix covering every artifact of a project.
pub fn project_prefix(owner_id: &str, project_id: &str) -> String {
    format!("{}/{}/{}/", NAMESPACE, owner_id, project_id)
}

/// Prefix covering every artifact a job wrote under one kind.
pub fn job_prefix(owner_id: &str, project_id: &str, kind: ArtifactKind, job_id: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}/",
        NAMESPACE,
        owner_id,
        project_id,
        kind.as_str(),
        job_id
    )
}

fn validate_segment(label: &str, segment: &str) -> StorageResult<()> {
    if segment.is_empty() {
        return Err(StorageError::InvalidKey(format!("{} segment is empty", label)));
    }
    if segment.contains('/') || segment.contains("..") {
        return Err(StorageError::InvalidKey(format!(
            "{} segment {:?} contains path separators",
            label, segment
        )));
    }
    Ok(())
}
