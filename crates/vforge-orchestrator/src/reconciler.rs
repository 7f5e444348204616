//! Three-way state reconciliation.
//!
//! Claimed state (the job record, the project's clip list) is corrected
//! against verified reality: blob storage first, then the execution
//! engine's verdict, then a staleness timeout as the backstop.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use vforge_engine::{EngineError, ExecutionEngine, ExecutionRef, ExecutionStatus};
use vforge_firestore::{JobRepository, ProjectRepository};
use vforge_models::{JobError, JobRecord, JobStatus, JobType, ProjectId, ProjectStatus};
use vforge_storage::R2Client;

use crate::error::OrchestratorResult;

/// Message recorded on staleness corrections.
const TIMEOUT_MESSAGE: &str =
    "Processing timed out. The worker may have crashed. Please try again.";

/// Correction chosen by the decision core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// The declared output exists: the job finished but the final status
    /// write was lost.
    MarkCompleted,
    /// The engine reports a terminal verdict the record disagrees with.
    AdoptEngineVerdict(JobStatus),
    /// Non-terminal for too long with no engine signal.
    MarkTimedOut,
}

/// Decide which correction (if any) applies. Checks fire in order and the
/// first hit wins.
pub fn decide(
    record: &JobRecord,
    output_exists: bool,
    engine_status: Option<ExecutionStatus>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Option<Correction> {
    // (a) Verified output beats every recorded status.
    if output_exists && record.status != JobStatus::Completed {
        return Some(Correction::MarkCompleted);
    }
    if output_exists {
        return None;
    }

    // (b) Engine verdict beats the record.
    if let Some(verdict) = engine_status {
        let adopted = match verdict {
            ExecutionStatus::Succeeded => Some(JobStatus::Completed),
            ExecutionStatus::Failed => Some(JobStatus::Failed),
            ExecutionStatus::Running => None,
        };
        if let Some(status) = adopted {
            if record.status != status {
                return Some(Correction::AdoptEngineVerdict(status));
            }
            return None;
        }
        // Still running according to the engine: alive, not stale.
        return None;
    }

    // (c) No corroborating signal past the staleness threshold.
    if record.is_active() && (now - record.updated_at) > stale_after {
        return Some(Correction::MarkTimedOut);
    }

    None
}

/// Reconciler over live collaborators.
pub struct StateReconciler {
    jobs: JobRepository,
    projects: ProjectRepository,
    storage: R2Client,
    engine: Arc<dyn ExecutionEngine>,
    stale_after: Duration,
}

impl StateReconciler {
    pub fn new(
        jobs: JobRepository,
        projects: ProjectRepository,
        storage: R2Client,
        engine: Arc<dyn ExecutionEngine>,
        stale_after: Duration,
    ) -> Self {
        Self {
            jobs,
            projects,
            storage,
            engine,
            stale_after,
        }
    }

    /// Correct a job record against verified reality. Returns whether a
    /// correction was written, so callers re-read fresh state.
    pub async fn reconcile(&self, record: &JobRecord) -> OrchestratorResult<bool> {
        let output_exists = match self.storage.exists(&record.payload.output_ref).await {
            Ok(exists) => exists,
            Err(e) => {
                // Unknown is not evidence; fall through to the other checks.
                warn!(job_id = %record.job_id, "Output existence check failed: {}", e);
                false
            }
        };

        let engine_status = match &record.execution_ref {
            Some(execution_ref) => {
                match self
                    .engine
                    .status(&ExecutionRef(execution_ref.clone()))
                    .await
                {
                    Ok(status) => Some(status),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => {
                        warn!(job_id = %record.job_id, "Engine status check failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let correction = decide(
            record,
            output_exists,
            engine_status,
            Utc::now(),
            self.stale_after,
        );

        let Some(correction) = correction else {
            return Ok(false);
        };

        info!(
            job_id = %record.job_id,
            status = %record.status,
            "Reconciling job: {:?}", correction
        );

        let applied = match correction {
            Correction::MarkCompleted => {
                self.jobs
                    .apply_correction(
                        &record.job_id,
                        |fresh| fresh.status != JobStatus::Completed,
                        JobStatus::Completed,
                        "Completed (output verified in storage)",
                        None,
                    )
                    .await?
            }
            Correction::AdoptEngineVerdict(status) => {
                let error = (status == JobStatus::Failed).then(|| {
                    JobError::new("external_failure", "Execution engine reported failure")
                });
                self.jobs
                    .apply_correction(
                        &record.job_id,
                        move |fresh| fresh.status != status,
                        status,
                        "Corrected from execution engine verdict",
                        error.as_ref(),
                    )
                    .await?
            }
            Correction::MarkTimedOut => {
                let error = JobError::new("timeout", TIMEOUT_MESSAGE);
                let stale_after = self.stale_after;
                self.jobs
                    .apply_correction(
                        &record.job_id,
                        move |fresh| {
                            fresh.is_active() && (Utc::now() - fresh.updated_at) > stale_after
                        },
                        JobStatus::Failed,
                        TIMEOUT_MESSAGE,
                        Some(&error),
                    )
                    .await?
            }
        };

        Ok(applied)
    }

    /// Verify every clip ref a project claims, rebuild the list with `None`
    /// for missing entries, and recompute the summary status. Returns
    /// whether a correction was written.
    pub async fn reconcile_project(&self, project_id: &ProjectId) -> OrchestratorResult<bool> {
        let Some((project, update_time)) = self.projects.get_with_meta(project_id).await? else {
            return Ok(false);
        };

        let mut verified: Vec<Option<String>> = Vec::with_capacity(project.clip_refs.len());
        let mut present = 0usize;
        for claimed in &project.clip_refs {
            match claimed {
                Some(clip_ref) => match self.storage.exists(clip_ref).await {
                    Ok(true) => {
                        present += 1;
                        verified.push(Some(clip_ref.clone()));
                    }
                    Ok(false) => {
                        warn!(
                            project_id = %project_id,
                            "Claimed clip missing from storage: {}", clip_ref
                        );
                        verified.push(None);
                    }
                    Err(e) => {
                        // Unknown keeps the claim; a flaky check must not
                        // wipe a real clip.
                        warn!(project_id = %project_id, "Clip check failed: {}", e);
                        present += 1;
                        verified.push(Some(clip_ref.clone()));
                    }
                },
                None => verified.push(None),
            }
        }

        let latest = self
            .jobs
            .latest_for_project(project_id, JobType::Generation)
            .await?;
        let job_active = latest.as_ref().map(JobRecord::is_active).unwrap_or(false);
        let job_ran = latest.as_ref().map(JobRecord::is_terminal).unwrap_or(false);

        let expected = project.expected_clips as usize;
        let status = ProjectStatus::summarize(present, expected, job_active, job_ran);

        if verified == project.clip_refs && status == project.status {
            return Ok(false);
        }

        info!(
            project_id = %project_id,
            present, expected, job_active,
            "Reconciling project: {} -> {}", project.status, status
        );

        self.projects
            .apply_reconciliation(project_id, &verified, status, update_time.as_deref())
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vforge_models::{JobId, JobOptions, JobPayload, JobType, StitchingOptions};

    fn record(status: JobStatus) -> JobRecord {
        let payload = JobPayload {
            job_id: JobId::from("j1"),
            project_id: ProjectId::from("p1"),
            owner_id: "u1".to_string(),
            input_refs: vec!["a".into(), "b".into()],
            output_ref: "media/u1/p1/outputs/j1/final.mp4".to_string(),
            options: JobOptions::Stitching(StitchingOptions::default()),
            retry_attempt: 0,
        };
        let mut record = JobRecord::new(JobType::Stitching, "u1", payload);
        record.status = status;
        record
    }

    fn stale_after() -> Duration {
        Duration::minutes(30)
    }

    #[test]
    fn verified_output_always_completes() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(
                decide(&record(status), true, None, Utc::now(), stale_after()),
                Some(Correction::MarkCompleted),
                "status {:?} must be corrected to completed",
                status
            );
        }
        // Already completed: nothing to do.
        assert_eq!(
            decide(&record(JobStatus::Completed), true, None, Utc::now(), stale_after()),
            None
        );
    }

    #[test]
    fn output_check_precedes_engine_verdict() {
        // Even a failed engine verdict loses to a verified output.
        assert_eq!(
            decide(
                &record(JobStatus::Running),
                true,
                Some(ExecutionStatus::Failed),
                Utc::now(),
                stale_after()
            ),
            Some(Correction::MarkCompleted)
        );
    }

    #[test]
    fn engine_verdict_adopted_when_record_disagrees() {
        assert_eq!(
            decide(
                &record(JobStatus::Running),
                false,
                Some(ExecutionStatus::Failed),
                Utc::now(),
                stale_after()
            ),
            Some(Correction::AdoptEngineVerdict(JobStatus::Failed))
        );
        assert_eq!(
            decide(
                &record(JobStatus::Running),
                false,
                Some(ExecutionStatus::Succeeded),
                Utc::now(),
                stale_after()
            ),
            Some(Correction::AdoptEngineVerdict(JobStatus::Completed))
        );
        // Agreement needs no correction.
        assert_eq!(
            decide(
                &record(JobStatus::Failed),
                false,
                Some(ExecutionStatus::Failed),
                Utc::now(),
                stale_after()
            ),
            None
        );
    }

    #[test]
    fn running_engine_signal_suppresses_timeout() {
        let mut stale = record(JobStatus::Running);
        stale.updated_at = Utc::now() - Duration::hours(2);

        assert_eq!(
            decide(
                &stale,
                false,
                Some(ExecutionStatus::Running),
                Utc::now(),
                stale_after()
            ),
            None
        );
    }

    #[test]
    fn stale_without_signal_times_out() {
        let mut stale = record(JobStatus::Running);
        stale.updated_at = Utc::now() - Duration::hours(2);

        assert_eq!(
            decide(&stale, false, None, Utc::now(), stale_after()),
            Some(Correction::MarkTimedOut)
        );

        // Fresh records are left alone.
        assert_eq!(
            decide(&record(JobStatus::Running), false, None, Utc::now(), stale_after()),
            None
        );

        // Terminal records cannot time out.
        let mut old_failed = record(JobStatus::Failed);
        old_failed.updated_at = Utc::now() - Duration::hours(2);
        assert_eq!(
            decide(&old_failed, false, None, Utc::now(), stale_after()),
            None
        );
    }
}
