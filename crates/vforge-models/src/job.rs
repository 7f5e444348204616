//! Job records and lifecycle states.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::payload::JobPayload;
use crate::project::ProjectId;

/// Unique identifier for a job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Stitch multiple source clips into a single output video
    Stitching,
    /// Generate one clip per prompt for a project
    Generation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Stitching => "stitching",
            JobType::Generation => "generation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle state as recorded in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record written, dispatch to the execution engine pending or in flight
    #[default]
    Queued,
    /// A runner owns the job and is executing stages
    Running,
    /// All stages succeeded
    Completed,
    /// Unrecoverable error, or staleness correction
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active states count against the one-active-job admission invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    /// Stable machine-readable code (e.g. "external_tool", "timeout")
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Durable record of one job attempt.
///
/// Created by the orchestrator at dispatch time. Mutated by the owning
/// runner while running, and by the orchestrator/reconciler when correcting
/// stale state. Never deleted except by the retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Unique job ID
    pub job_id: JobId,

    /// Job type
    pub job_type: JobType,

    /// Owning project
    pub project_id: ProjectId,

    /// Owning user
    pub owner_id: String,

    /// Lifecycle state
    #[serde(default)]
    pub status: JobStatus,

    /// Progress percentage (0.0-100.0, -1.0 on error)
    #[serde(default)]
    pub progress: f64,

    /// Human-readable status line
    #[serde(default)]
    pub message: String,

    /// Stage currently executing (denormalized from the progress log)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    /// Immutable input parameters
    pub payload: JobPayload,

    /// Number of retry attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// Maximum retries before the orchestrator stops re-dispatching
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// When a runner picked the job up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Opaque handle into the execution engine, set once dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_ref: Option<String>,

    /// Structured error (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobRecord {
    /// Create a new queued record for a payload.
    pub fn new(job_type: JobType, owner_id: impl Into<String>, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            job_id: payload.job_id.clone(),
            job_type,
            project_id: payload.project_id.clone(),
            owner_id: owner_id.into(),
            status: JobStatus::Queued,
            progress: 0.0,
            message: "Queued".to_string(),
            current_stage: None,
            payload,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            execution_ref: None,
            error: None,
        }
    }

    /// Record the execution engine handle after dispatch.
    pub fn dispatch(mut self, execution_ref: impl Into<String>) -> Self {
        self.execution_ref = Some(execution_ref.into());
        self.updated_at = Utc::now();
        self
    }

    /// Mark the job as running.
    pub fn start(mut self) -> Self {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Mark the job as completed.
    pub fn complete(mut self) -> Self {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.message = "Completed".to_string();
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Mark the job as failed with a structured error.
    pub fn fail(mut self, error: JobError) -> Self {
        self.status = JobStatus::Failed;
        self.message = error.message.clone();
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    /// Mark the job as cancelled.
    pub fn cancel(mut self) -> Self {
        self.status = JobStatus::Cancelled;
        self.message = "Cancelled".to_string();
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// True when a failed attempt is still under the retry ceiling.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Age of the last update, used by staleness checks.
    pub fn seconds_since_update(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{JobOptions, StitchingOptions};
    use crate::project::ProjectId;

    fn stitch_payload() -> JobPayload {
        JobPayload {
            job_id: JobId::new(),
            project_id: ProjectId::from_string("p1"),
            owner_id: "u1".to_string(),
            input_refs: vec!["a.mp4".into(), "b.mp4".into()],
            output_ref: "out/p1.mp4".to_string(),
            options: JobOptions::Stitching(StitchingOptions::default()),
            retry_attempt: 0,
        }
    }

    #[test]
    fn record_lifecycle() {
        let record = JobRecord::new(JobType::Stitching, "u1", stitch_payload());
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.is_active());

        let record = record.dispatch("exec-1").start();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.started_at.is_some());
        assert_eq!(record.execution_ref.as_deref(), Some("exec-1"));

        let record = record.complete();
        assert_eq!(record.status, JobStatus::Completed);
        assert!((record.progress - 100.0).abs() < f64::EPSILON);
        assert!(record.is_terminal());
        assert!(!record.is_active());
    }

    #[test]
    fn retry_ceiling() {
        let record = JobRecord::new(JobType::Stitching, "u1", stitch_payload());
        let mut failed = record.fail(JobError::new("external_tool", "ffmpeg exited 1"));
        assert!(failed.can_retry());

        failed.retry_count = failed.max_retries;
        assert!(!failed.can_retry());
    }

    #[test]
    fn cancelled_is_terminal() {
        let record = JobRecord::new(JobType::Generation, "u1", stitch_payload()).cancel();
        assert!(record.is_terminal());
        assert_eq!(record.status.as_str(), "cancelled");
    }
}
