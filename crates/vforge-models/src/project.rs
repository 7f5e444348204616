//! Project projection: the caller-visible entity whose clip list and
//! status are kept consistent with blob-store reality.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Project readiness summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created, not all clips generated, no job currently producing them
    #[default]
    Draft,
    /// A job is actively producing clips
    Generating,
    /// Every expected clip is verified present
    Ready,
    /// A job ran and nothing usable landed
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Generating => "generating",
            ProjectStatus::Ready => "ready",
            ProjectStatus::Error => "error",
        }
    }

    /// Recompute the summary from verified storage contents.
    ///
    /// `present` is the count of clip refs verified to exist in blob
    /// storage, `expected` the requested clip count, `job_active` whether a
    /// generation job is currently queued/running, and `job_ran` whether any
    /// prior attempt reached a terminal state. An active job wins over
    /// verified-missing artifacts: clips may still be mid-upload.
    pub fn summarize(present: usize, expected: usize, job_active: bool, job_ran: bool) -> Self {
        if expected == 0 {
            return ProjectStatus::Draft;
        }
        if present >= expected {
            return ProjectStatus::Ready;
        }
        if job_active {
            return ProjectStatus::Generating;
        }
        if present > 0 {
            return ProjectStatus::Draft;
        }
        if job_ran {
            ProjectStatus::Error
        } else {
            ProjectStatus::Draft
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable projection of a project's generated clips.
///
/// `clip_refs` is sized to the number of requested prompts with `None`
/// placeholders for not-yet-generated clips. The runner fills entries per
/// completed unit of work; the reconciler independently corrects them
/// against blob-store reality.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectRecord {
    /// Unique project ID
    pub project_id: ProjectId,

    /// Owning user
    pub owner_id: String,

    /// Readiness summary
    #[serde(default)]
    pub status: ProjectStatus,

    /// Requested clip count
    #[serde(default)]
    pub expected_clips: u32,

    /// Per-slot clip blob refs, `None` until generated
    #[serde(default)]
    pub clip_refs: Vec<Option<String>>,

    /// Stitched output blob ref, once produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    /// Create a draft project expecting `expected_clips` clips.
    pub fn new(project_id: ProjectId, owner_id: impl Into<String>, expected_clips: u32) -> Self {
        let now = Utc::now();
        Self {
            project_id,
            owner_id: owner_id.into(),
            status: ProjectStatus::Draft,
            expected_clips,
            clip_refs: vec![None; expected_clips as usize],
            output_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Count of clip slots with a claimed ref.
    pub fn claimed_clips(&self) -> usize {
        self.clip_refs.iter().filter(|r| r.is_some()).count()
    }

    /// Set the clip ref for a slot, growing the list if the projection was
    /// created before the prompt count was known.
    pub fn set_clip_ref(&mut self, index: usize, clip_ref: impl Into<String>) {
        if index >= self.clip_refs.len() {
            self.clip_refs.resize(index + 1, None);
        }
        self.clip_refs[index] = Some(clip_ref.into());
        self.updated_at = Utc::now();
    }
}
