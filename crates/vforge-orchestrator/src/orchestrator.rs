//! Job orchestrator: admission, dispatch, status, cancellation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use vforge_engine::{ExecutionClient, ExecutionEngine};
use vforge_firestore::{
    FirestoreClient, JobRepository, ProgressRepository, ProjectRepository,
};
use vforge_models::{
    JobError, JobId, JobOptions, JobPayload, JobRecord, JobStatus, JobType, ProgressSnapshot,
    ProjectId, ProjectRecord, RECENT_LOG_LINES,
};
use vforge_storage::{clip_key, output_key, R2Client};

use crate::admission::AdmissionLock;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::reconciler::StateReconciler;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Non-terminal records older than this with no engine signal are
    /// presumed dead
    pub stale_after: chrono::Duration,
    /// Admission lock TTL
    pub lock_ttl: Duration,
    /// Retry ceiling for failed attempts
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(30),
            lock_ttl: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            stale_after: chrono::Duration::seconds(
                std::env::var("JOB_STALE_AFTER_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1800),
            ),
            lock_ttl: Duration::from_secs(
                std::env::var("ADMISSION_LOCK_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_retries: std::env::var("JOB_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// The control plane for background jobs.
pub struct JobOrchestrator {
    jobs: JobRepository,
    projects: ProjectRepository,
    progress: ProgressRepository,
    engine: Arc<dyn ExecutionEngine>,
    admission: AdmissionLock,
    reconciler: StateReconciler,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        jobs: JobRepository,
        projects: ProjectRepository,
        progress: ProgressRepository,
        storage: R2Client,
        engine: Arc<dyn ExecutionEngine>,
        admission: AdmissionLock,
        config: OrchestratorConfig,
    ) -> Self {
        let reconciler = StateReconciler::new(
            jobs.clone(),
            projects.clone(),
            storage,
            Arc::clone(&engine),
            config.stale_after,
        );

        Self {
            jobs,
            projects,
            progress,
            engine,
            admission,
            reconciler,
            config,
        }
    }

    /// Build the control plane from the environment.
    pub async fn from_env() -> OrchestratorResult<Self> {
        let config = OrchestratorConfig::from_env();
        let firestore = FirestoreClient::from_env().await?;
        let storage = R2Client::from_env().await?;
        let engine: Arc<dyn ExecutionEngine> = Arc::new(ExecutionClient::from_env()?);
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let admission = AdmissionLock::new(&redis_url, config.lock_ttl)?;

        Ok(Self::new(
            JobRepository::new(firestore.clone()),
            ProjectRepository::new(firestore.clone()),
            ProgressRepository::new(firestore),
            storage,
            engine,
            admission,
            config,
        ))
    }

    /// The reconciler, for the sweep.
    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    /// Start (or retry) a job for a project.
    ///
    /// Admission control runs under the distributed lock: the latest record
    /// is reconciled first, an active job rejects the trigger unless
    /// `force_restart`, a completed job is an idempotent no-op, and a
    /// failed attempt under the retry ceiling is re-dispatched with the
    /// same id.
    pub async fn trigger(
        &self,
        project_id: &ProjectId,
        owner_id: &str,
        job_type: JobType,
        input_refs: Vec<String>,
        options: JobOptions,
        force_restart: bool,
    ) -> OrchestratorResult<JobRecord> {
        validate_options(job_type, &options)?;

        let guard = self.admission.acquire(project_id, job_type).await?;
        let result = self
            .admit_and_dispatch(project_id, owner_id, job_type, input_refs, options, force_restart)
            .await;
        guard.release().await;
        result
    }

    async fn admit_and_dispatch(
        &self,
        project_id: &ProjectId,
        owner_id: &str,
        job_type: JobType,
        input_refs: Vec<String>,
        options: JobOptions,
        force_restart: bool,
    ) -> OrchestratorResult<JobRecord> {
        if let Some(mut latest) = self.jobs.latest_for_project(project_id, job_type).await? {
            // Reconcile before deciding whether it still counts as active.
            if self.reconciler.reconcile(&latest).await? {
                if let Some(fresh) = self.jobs.get(&latest.job_id).await? {
                    latest = fresh;
                }
            }

            if latest.is_active() && !force_restart {
                return Err(OrchestratorError::AlreadyRunning {
                    job_id: latest.job_id,
                    job_type: job_type.as_str().to_string(),
                });
            }

            if !force_restart {
                if latest.status == JobStatus::Completed {
                    // Idempotent no-op: the work is already done.
                    info!(job_id = %latest.job_id, "Trigger is a no-op, job already completed");
                    return Ok(latest);
                }

                if latest.can_retry() {
                    return self.redispatch(latest).await;
                }
            }
        }

        let record = build_record(
            project_id,
            owner_id,
            job_type,
            input_refs,
            options,
            self.config.max_retries,
        )?;
        self.jobs.create(&record).await?;
        self.dispatch(record).await
    }

    /// Re-dispatch a failed attempt with an incremented retry count and the
    /// same job id.
    async fn redispatch(&self, record: JobRecord) -> OrchestratorResult<JobRecord> {
        let retry_count = record.retry_count + 1;
        info!(
            job_id = %record.job_id,
            retry_count, "Re-dispatching failed job"
        );

        self.jobs.requeue_for_retry(&record.job_id, retry_count).await?;

        let mut record = record;
        record.retry_count = retry_count;
        record.payload.retry_attempt = retry_count;
        self.dispatch(record).await
    }

    /// Record first, dispatch second. A dispatch failure marks the record
    /// failed synchronously instead of leaving it queued forever.
    async fn dispatch(&self, record: JobRecord) -> OrchestratorResult<JobRecord> {
        match self
            .engine
            .run(&record.job_id, record.job_type, &record.payload)
            .await
        {
            Ok(execution_ref) => {
                self.jobs
                    .set_execution_ref(&record.job_id, execution_ref.as_str())
                    .await?;
                info!(
                    job_id = %record.job_id,
                    execution_ref = %execution_ref,
                    "Dispatched job"
                );
                Ok(record.dispatch(execution_ref.as_str()))
            }
            Err(e) => {
                warn!(job_id = %record.job_id, "Dispatch failed: {}", e);
                let error = JobError::new("dispatch_failed", e.to_string());
                if let Err(write_err) = self.jobs.fail(&record.job_id, &error).await {
                    warn!(
                        job_id = %record.job_id,
                        "Failed to mark dispatch failure: {}", write_err
                    );
                }
                Err(OrchestratorError::DispatchFailed(e.to_string()))
            }
        }
    }

    /// The currently-active job for a `(project, type)` pair, after
    /// reconciliation.
    pub async fn get_active_job(
        &self,
        project_id: &ProjectId,
        job_type: JobType,
    ) -> OrchestratorResult<Option<JobRecord>> {
        let Some(mut latest) = self.jobs.latest_for_project(project_id, job_type).await? else {
            return Ok(None);
        };

        if self.reconciler.reconcile(&latest).await? {
            if let Some(fresh) = self.jobs.get(&latest.job_id).await? {
                latest = fresh;
            }
        }

        Ok(latest.is_active().then_some(latest))
    }

    /// Status snapshot for polling clients.
    pub async fn get_status(&self, job_id: &JobId) -> OrchestratorResult<ProgressSnapshot> {
        let record = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", job_id)))?;

        let recent = self
            .progress
            .recent(job_id, RECENT_LOG_LINES as u32)
            .await
            .unwrap_or_default();

        let estimated_time_remaining_seconds = recent
            .last()
            .and_then(|entry| entry.metadata.get("eta_seconds"))
            .and_then(serde_json::Value::as_f64);

        Ok(ProgressSnapshot {
            job_id: record.job_id.clone(),
            status: record.status,
            progress_percent: record.progress,
            current_stage: record.current_stage.clone(),
            message: record.message.clone(),
            recent_log: recent.into_iter().map(|e| e.message).collect(),
            estimated_time_remaining_seconds,
        })
    }

    /// Cancel a job. Ownership-checked; terminal states are a no-op
    /// success.
    pub async fn cancel(&self, job_id: &JobId, owner_id: &str) -> OrchestratorResult<JobRecord> {
        let record = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("job {}", job_id)))?;

        if record.owner_id != owner_id {
            return Err(OrchestratorError::PermissionDenied(format!(
                "job {} belongs to another user",
                job_id
            )));
        }

        if record.is_terminal() {
            return Ok(record);
        }

        self.jobs.cancel(job_id).await?;
        info!(job_id = %job_id, "Cancelled job");

        Ok(self.jobs.get(job_id).await?.unwrap_or(record))
    }

    /// Recent jobs for a project, newest first.
    pub async fn list_for_project(
        &self,
        project_id: &ProjectId,
        limit: u32,
    ) -> OrchestratorResult<Vec<JobRecord>> {
        Ok(self.jobs.list_for_project(project_id, limit).await?)
    }

    /// Reconcile a project's clip list against storage.
    pub async fn reconcile_project(&self, project_id: &ProjectId) -> OrchestratorResult<bool> {
        self.reconciler.reconcile_project(project_id).await
    }

    /// Ensure the project projection exists and is sized to the expected
    /// clip count before a generation job runs.
    pub async fn ensure_project(
        &self,
        project_id: &ProjectId,
        owner_id: &str,
        expected_clips: u32,
    ) -> OrchestratorResult<()> {
        if self.projects.get(project_id).await?.is_none() {
            let project = ProjectRecord::new(project_id.clone(), owner_id, expected_clips);
            self.projects.create(&project).await?;
        }
        Ok(())
    }
}

/// Options must match the job type, and carry enough to do the work.
fn validate_options(job_type: JobType, options: &JobOptions) -> OrchestratorResult<()> {
    match (job_type, options) {
        (JobType::Stitching, JobOptions::Stitching(_)) => Ok(()),
        (JobType::Generation, JobOptions::Generation(opts)) => {
            if opts.prompts.is_empty() {
                return Err(OrchestratorError::validation("no prompts given"));
            }
            Ok(())
        }
        _ => Err(OrchestratorError::validation(format!(
            "options do not match job type {}",
            job_type.as_str()
        ))),
    }
}

/// Build the record and payload for a fresh attempt.
fn build_record(
    project_id: &ProjectId,
    owner_id: &str,
    job_type: JobType,
    input_refs: Vec<String>,
    options: JobOptions,
    max_retries: u32,
) -> OrchestratorResult<JobRecord> {
    let job_id = JobId::new();

    let output_ref = match &options {
        JobOptions::Stitching(_) => output_key(
            owner_id,
            project_id.as_str(),
            job_id.as_str(),
            "final.mp4",
        )?,
        JobOptions::Generation(opts) => {
            // The final clip in the sequence doubles as the completion
            // marker: clips generate in order, so its presence implies the
            // run finished.
            let last = opts.prompts.len().saturating_sub(1);
            clip_key(
                owner_id,
                project_id.as_str(),
                job_id.as_str(),
                &format!("clip_{:02}.mp4", last),
            )?
        }
    };

    let payload = JobPayload {
        job_id,
        project_id: project_id.clone(),
        owner_id: owner_id.to_string(),
        input_refs,
        output_ref,
        options,
        retry_attempt: 0,
    };
    payload
        .validate()
        .map_err(|e| OrchestratorError::validation(e.to_string()))?;

    let mut record = JobRecord::new(job_type, owner_id, payload);
    record.max_retries = max_retries;
    Ok(record)
}
