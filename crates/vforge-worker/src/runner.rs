//! The per-job runner state machine.
//!
//! One process runs one job: parse payload → initialize → resume-or-start
//! → execute stages → finalize. The completion path always writes a
//! terminal status; a host shutdown signal triggers a best-effort
//! checkpoint of the current resumable state before the process exits.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{info, warn};

use vforge_engine::{ClipSynthesizer, SynthesisClient};
use vforge_firestore::{
    CheckpointRepository, FirestoreClient, JobRepository, ProgressRepository, ProjectRepository,
};
use vforge_models::{Checkpoint, JobId, JobPayload, JobRecord, JobStatus, JobType, SHUTDOWN_STAGE};
use vforge_storage::R2Client;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::progress::ProgressSink;
use crate::{generation, stitching};

/// Shared clients and repositories for a runner process.
pub struct RunnerContext {
    pub config: WorkerConfig,
    pub storage: R2Client,
    pub jobs: JobRepository,
    pub checkpoints: CheckpointRepository,
    pub progress_log: ProgressRepository,
    pub projects: ProjectRepository,
    pub synthesizer: Arc<dyn ClipSynthesizer>,
}

impl RunnerContext {
    /// Build the context from the environment.
    pub async fn new(config: WorkerConfig) -> WorkerResult<Self> {
        let storage = R2Client::from_env().await?;
        let firestore = FirestoreClient::from_env().await?;
        let synthesizer: Arc<dyn ClipSynthesizer> = Arc::new(SynthesisClient::from_env()?);

        Ok(Self {
            config,
            storage,
            jobs: JobRepository::new(firestore.clone()),
            checkpoints: CheckpointRepository::new(firestore.clone()),
            progress_log: ProgressRepository::new(firestore.clone()),
            projects: ProjectRepository::new(firestore),
            synthesizer,
        })
    }
}

/// In-memory resumable state, checkpointed at stage boundaries and on
/// shutdown.
#[derive(Debug, Default, Clone)]
pub struct ResumableState {
    /// Verified local input files, in stitch order
    pub downloaded: Vec<PathBuf>,
    /// Local stitched output, once produced
    pub stitched_output: Option<PathBuf>,
    /// Generated clip refs by prompt index
    pub generated: BTreeMap<usize, String>,
}

impl ResumableState {
    /// Serialize into checkpoint data.
    pub fn to_checkpoint_data(&self) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert(
            "downloaded".to_string(),
            json!(self
                .downloaded
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect::<Vec<_>>()),
        );
        if let Some(output) = &self.stitched_output {
            data.insert(
                "stitched_output".to_string(),
                json!(output.to_string_lossy().to_string()),
            );
        }
        data.insert(
            "generated".to_string(),
            json!(self
                .generated
                .iter()
                .map(|(i, r)| (i.to_string(), r.clone()))
                .collect::<HashMap<_, _>>()),
        );
        data
    }

    /// Restore from a checkpoint, trusting nothing yet.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let downloaded = checkpoint
            .string_list("downloaded")
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect();

        let stitched_output = checkpoint.string("stitched_output").map(PathBuf::from);

        let generated = checkpoint
            .data
            .get("generated")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| {
                        Some((k.parse::<usize>().ok()?, v.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            downloaded,
            stitched_output,
            generated,
        }
    }

    /// Drop local paths that no longer exist on this host. Stale paths
    /// from a previous container must never be trusted.
    pub fn verify_local_artifacts(&mut self) {
        self.downloaded.retain(|path| {
            let present = path.exists();
            if !present {
                warn!("Dropping unverifiable checkpoint path: {}", path.display());
            }
            present
        });

        if let Some(output) = &self.stitched_output {
            if !output.exists() {
                warn!(
                    "Dropping unverifiable stitched output: {}",
                    output.display()
                );
                self.stitched_output = None;
            }
        }
    }
}

/// Everything a stage pipeline needs for one job.
pub struct JobSession {
    pub ctx: Arc<RunnerContext>,
    pub record: JobRecord,
    pub sink: Arc<ProgressSink>,
    pub state: Arc<Mutex<ResumableState>>,
    checkpoint_seq: AtomicU64,
}

impl JobSession {
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.record.payload
    }

    /// Snapshot the resumable state into a named checkpoint. Save failures
    /// propagate: the job must not claim progress it has not durably
    /// recorded.
    pub async fn save_checkpoint(&self, stage_name: &str) -> WorkerResult<()> {
        let data = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_checkpoint_data();

        let mut checkpoint = Checkpoint::new(
            self.record.job_id.clone(),
            stage_name,
            self.checkpoint_seq.fetch_add(1, Ordering::SeqCst),
        );
        checkpoint.data = data;

        self.ctx.checkpoints.save(&checkpoint).await?;
        Ok(())
    }

    /// Cancellation wins over further stage transitions, but is only
    /// checked between stages; it never interrupts an in-flight tool call.
    pub async fn ensure_not_cancelled(&self) -> WorkerResult<()> {
        match self.ctx.jobs.get(&self.record.job_id).await {
            Ok(Some(record)) if record.status == JobStatus::Cancelled => {
                Err(WorkerError::Cancelled)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // A status read failure must not kill a healthy job.
                warn!(job_id = %self.record.job_id, "Cancellation check failed: {}", e);
                Ok(())
            }
        }
    }

    /// Local scratch directory for this job.
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.ctx.config.work_dir).join(self.record.job_id.as_str())
    }
}

/// The per-job state machine.
pub struct JobRunner {
    ctx: Arc<RunnerContext>,
}

impl JobRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Run one job from its serialized payload. Returns `Ok` only when the
    /// job reached `completed`.
    pub async fn run(&self, raw_payload: &str) -> WorkerResult<()> {
        // Parse and validate before any side effect.
        let payload = JobPayload::from_json(raw_payload)?;
        let job_id = payload.job_id.clone();

        let Some(record) = self.ctx.jobs.get(&job_id).await? else {
            return Err(WorkerError::Validation(format!(
                "no job record for {}",
                job_id
            )));
        };

        let logger = JobLogger::new(&job_id, record.job_type.as_str());

        if record.is_terminal() {
            // Redelivered after completion: nothing to do.
            logger.log_progress("Job already terminal, skipping");
            return Ok(());
        }

        let sink = Arc::new(
            ProgressSink::new(
                job_id.clone(),
                self.ctx.jobs.clone(),
                self.ctx.progress_log.clone(),
            )
            .await,
        );

        // Resume only on retry attempts with a usable checkpoint.
        let (resume, next_checkpoint_seq) = self.load_resume_state(&payload).await;

        self.ctx.jobs.mark_running(&job_id).await?;
        logger.log_start(if payload.retry_attempt > 0 {
            "Resuming job"
        } else {
            "Starting job"
        });

        let session = JobSession {
            ctx: Arc::clone(&self.ctx),
            record,
            sink: Arc::clone(&sink),
            state: Arc::new(Mutex::new(resume)),
            checkpoint_seq: AtomicU64::new(next_checkpoint_seq),
        };

        let result = tokio::select! {
            result = Self::run_pipeline(&session) => result,
            _ = shutdown_signal() => {
                self.handle_shutdown(&session).await;
                Err(WorkerError::Interrupted)
            }
        };

        self.finalize(&session, result, &logger).await
    }

    async fn run_pipeline(session: &JobSession) -> WorkerResult<()> {
        match session.record.job_type {
            JobType::Stitching => stitching::run(session).await,
            JobType::Generation => generation::run(session).await,
        }
    }

    /// Restore resumable state for a retry attempt. A checkpoint read
    /// failure degrades to a fresh start; it never resumes from guesses.
    async fn load_resume_state(&self, payload: &JobPayload) -> (ResumableState, u64) {
        if payload.retry_attempt == 0 {
            return (ResumableState::default(), 0);
        }

        match self.ctx.checkpoints.get_last(&payload.job_id).await {
            Ok(Some(checkpoint)) => {
                info!(
                    job_id = %payload.job_id,
                    stage = %checkpoint.stage_name,
                    "Resuming from checkpoint"
                );
                let mut state = ResumableState::from_checkpoint(&checkpoint);
                state.verify_local_artifacts();
                (state, checkpoint.sequence + 1)
            }
            Ok(None) => (ResumableState::default(), 0),
            Err(e) => {
                warn!(
                    job_id = %payload.job_id,
                    "Checkpoint read failed, starting fresh: {}", e
                );
                (ResumableState::default(), 0)
            }
        }
    }

    /// Best-effort synchronous checkpoint on a host shutdown signal. The
    /// record stays `running`; the execution engine's retry (or the
    /// staleness sweep) picks the job back up.
    async fn handle_shutdown(&self, session: &JobSession) {
        warn!(job_id = %session.record.job_id, "Shutdown signal received, checkpointing");

        let save = session.save_checkpoint(SHUTDOWN_STAGE);
        match tokio::time::timeout(self.ctx.config.shutdown_timeout, save).await {
            Ok(Ok(())) => info!(job_id = %session.record.job_id, "Shutdown checkpoint saved"),
            Ok(Err(e)) => warn!(job_id = %session.record.job_id, "Shutdown checkpoint failed: {}", e),
            Err(_) => warn!(job_id = %session.record.job_id, "Shutdown checkpoint timed out"),
        }
    }

    /// The finally-equivalent path: every outcome writes a terminal status
    /// or leaves an explicit reschedule trail, never an ambiguous state.
    async fn finalize(
        &self,
        session: &JobSession,
        result: WorkerResult<()>,
        logger: &JobLogger,
    ) -> WorkerResult<()> {
        let job_id = &session.record.job_id;

        match result {
            Ok(()) => {
                session
                    .sink
                    .stage_completed("finalize", 100.0, "Job completed")
                    .await;
                // The terminal status write comes last.
                self.ctx.jobs.complete(job_id).await?;
                self.cleanup_work_dir(session).await;
                logger.log_completion("All stages succeeded");
                Ok(())
            }
            Err(WorkerError::Cancelled) => {
                // The orchestrator already marked the record; make sure the
                // terminal state is in place even if that write was lost.
                if let Ok(Some(record)) = self.ctx.jobs.get(job_id).await {
                    if !record.is_terminal() {
                        self.ctx.jobs.cancel(job_id).await.ok();
                    }
                }
                self.cleanup_work_dir(session).await;
                logger.log_progress("Stopped on cancellation request");
                Err(WorkerError::Cancelled)
            }
            Err(WorkerError::Interrupted) => {
                // No terminal write: the checkpoint is the reschedule trail
                // and the engine retries the execution.
                logger.log_warning("Interrupted by shutdown, checkpoint saved");
                Err(WorkerError::Interrupted)
            }
            Err(e) => {
                let job_error = e.to_job_error();
                session.sink.error("pipeline", job_error.message.clone()).await;
                if let Err(write_err) = self.ctx.jobs.fail(job_id, &job_error).await {
                    // Surface both; the reconciler will correct the record.
                    logger.log_error(&format!(
                        "Failed to record job failure: {}",
                        write_err
                    ));
                }
                self.cleanup_work_dir(session).await;
                logger.log_error(&job_error.message);
                Err(e)
            }
        }
    }

    /// Remove the job's scratch directory. Failures only warn: retries
    /// recreate it and the host is ephemeral anyway.
    async fn cleanup_work_dir(&self, session: &JobSession) {
        let work_dir = session.work_dir();
        if work_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                warn!("Failed to clean work dir {}: {}", work_dir.display(), e);
            }
        }
    }
}

/// Resolves when the host asks the process to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                // Fall back to ctrl-c only.
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resumable_state_roundtrips_through_checkpoint_data() {
        let mut state = ResumableState::default();
        state.downloaded.push(PathBuf::from("/tmp/input_000_a.mp4"));
        state.generated.insert(2, "media/u1/p1/clips/j1/clip_02.mp4".to_string());
        state.stitched_output = Some(PathBuf::from("/tmp/out.mp4"));

        let mut checkpoint = Checkpoint::new(JobId::from("j1"), "download_complete", 3);
        checkpoint.data = state.to_checkpoint_data();

        let restored = ResumableState::from_checkpoint(&checkpoint);
        assert_eq!(restored.downloaded, state.downloaded);
        assert_eq!(restored.generated, state.generated);
        assert_eq!(restored.stitched_output, state.stitched_output);
    }

    #[test]
    fn verification_drops_stale_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let real = dir.path().join("real.mp4");
        std::fs::write(&real, b"x").unwrap();

        let mut state = ResumableState {
            downloaded: vec![real.clone(), PathBuf::from("/gone/phantom.mp4")],
            stitched_output: Some(PathBuf::from("/gone/out.mp4")),
            generated: BTreeMap::new(),
        };
        state.verify_local_artifacts();

        assert_eq!(state.downloaded, vec![real]);
        assert!(state.stitched_output.is_none());
    }

    #[test]
    fn from_checkpoint_tolerates_partial_data() {
        let mut checkpoint = Checkpoint::new(JobId::from("j1"), "clips_generated", 0);
        checkpoint.data.insert("generated".to_string(), json!({"0": "ref-a", "bad": "ref-b"}));

        let state = ResumableState::from_checkpoint(&checkpoint);
        assert_eq!(state.generated.len(), 1);
        assert_eq!(state.generated.get(&0).map(String::as_str), Some("ref-a"));
        assert!(state.downloaded.is_empty());
    }
}
