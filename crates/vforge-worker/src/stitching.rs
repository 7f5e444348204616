//! Stitching job pipeline.
//!
//! validate refs → download (bounded) → stitch via the six-stage pipeline
//! → upload → finalize project. Each stage boundary saves a checkpoint so a
//! crash resumes at the last completed stage instead of from zero, and a
//! stage observed complete in storage is skipped rather than re-run.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, info};

use vforge_media::{StitchEvent, StitchPipeline, StitchRequest, MIN_STITCH_INPUTS};
use vforge_models::{JobOptions, StitchingOptions};
use vforge_storage::StorageError;

use crate::error::{WorkerError, WorkerResult};
use crate::retry::{retry, RetryPolicy};
use crate::runner::JobSession;

pub(crate) async fn run(session: &JobSession) -> WorkerResult<()> {
    let payload = session.payload().clone();
    let JobOptions::Stitching(options) = &payload.options else {
        return Err(WorkerError::Validation(
            "stitching job carries non-stitching options".into(),
        ));
    };

    // Observed-complete is success: the prior attempt finished but its
    // final status write was lost.
    if session.ctx.storage.exists(&payload.output_ref).await? {
        info!(job_id = %session.job_id(), "Output already in storage, skipping stitch");
        session
            .sink
            .stage_completed("finalize", 99.0, "Output already present")
            .await;
        session
            .ctx
            .projects
            .set_output_ref(&payload.project_id, &payload.output_ref)
            .await?;
        return Ok(());
    }

    let work_dir = session.work_dir();
    tokio::fs::create_dir_all(&work_dir).await?;

    let local_inputs = acquire_inputs(session, &payload.input_refs, &work_dir).await?;
    let stitched = stitch(session, options, local_inputs, &work_dir).await?;
    upload(session, &stitched, &payload.output_ref).await?;

    session
        .ctx
        .projects
        .set_output_ref(&payload.project_id, &payload.output_ref)
        .await?;

    Ok(())
}

/// Validate refs in storage and download them, or restore the local file
/// list from the resume checkpoint.
async fn acquire_inputs(
    session: &JobSession,
    input_refs: &[String],
    work_dir: &std::path::Path,
) -> WorkerResult<Vec<PathBuf>> {
    let restored: Vec<PathBuf> = {
        let state = session
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.downloaded.clone()
    };

    // Checkpoint paths were already verified on disk at resume.
    if restored.len() >= MIN_STITCH_INPUTS {
        info!(
            job_id = %session.job_id(),
            "Restored {} inputs from checkpoint, skipping download",
            restored.len()
        );
        session
            .sink
            .stage_completed("download", 40.0, "Inputs restored from checkpoint")
            .await;
        return Ok(restored);
    }

    session.ensure_not_cancelled().await?;
    session
        .sink
        .stage_started("validate_inputs", 5.0, "Validating input clips")
        .await;

    let validation = session.ctx.storage.validate_refs(input_refs).await;
    if validation.valid_count() < MIN_STITCH_INPUTS {
        return Err(WorkerError::ResourceInsufficient {
            needed: MIN_STITCH_INPUTS,
            available: validation.valid_count(),
        });
    }
    session
        .sink
        .stage_completed(
            "validate_inputs",
            10.0,
            format!(
                "{} of {} inputs usable",
                validation.valid_count(),
                input_refs.len()
            ),
        )
        .await;

    session
        .sink
        .stage_started("download", 10.0, "Downloading input clips")
        .await;

    let inputs_dir = work_dir.join("inputs");
    let downloads = session
        .ctx
        .storage
        .download_refs(
            &validation.valid,
            &inputs_dir,
            session.ctx.config.max_download_parallel,
        )
        .await?;

    let files: Vec<PathBuf> = downloads
        .iter()
        .filter_map(|d| d.local_path.clone())
        .collect();
    if files.len() < MIN_STITCH_INPUTS {
        return Err(WorkerError::ResourceInsufficient {
            needed: MIN_STITCH_INPUTS,
            available: files.len(),
        });
    }

    {
        let mut state = session
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.downloaded = files.clone();
    }
    session.save_checkpoint("download_complete").await?;

    session
        .sink
        .stage_completed("download", 40.0, format!("Downloaded {} inputs", files.len()))
        .await;

    Ok(files)
}

/// Run the external-tool pipeline, or reuse a checkpointed local output.
async fn stitch(
    session: &JobSession,
    options: &StitchingOptions,
    inputs: Vec<PathBuf>,
    work_dir: &std::path::Path,
) -> WorkerResult<PathBuf> {
    let existing = {
        let state = session
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.stitched_output.clone()
    };
    if let Some(path) = existing {
        info!(
            job_id = %session.job_id(),
            "Restored stitched output from checkpoint, skipping transform"
        );
        session
            .sink
            .stage_completed("execute", 90.0, "Stitched output restored from checkpoint")
            .await;
        return Ok(path);
    }

    session.ensure_not_cancelled().await?;

    let request = StitchRequest {
        inputs,
        output: work_dir.join("stitched.mp4"),
        compression: options.compression,
        audio_enabled: options.audio_enabled,
        target_fps: options.target_fps,
        target_resolution: options.target_resolution,
        tool_timeout_secs: session.ctx.config.tool_timeout.as_secs(),
    };

    // Bridge the pipeline's sync callbacks onto the async sink.
    let (tx, mut rx) = mpsc::unbounded_channel::<StitchEvent>();
    let sink = std::sync::Arc::clone(&session.sink);
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StitchEvent::ToolProgress {
                    progress,
                    total_duration_secs,
                } => {
                    sink.tool_progress(
                        progress.out_time_secs(),
                        total_duration_secs,
                        progress.fps,
                        progress.speed,
                    )
                    .await;
                }
                StitchEvent::StageStarted(stage) => {
                    debug!("Stitch stage started: {}", stage.as_str());
                }
                StitchEvent::StageCompleted(stage) => {
                    debug!("Stitch stage completed: {}", stage.as_str());
                }
            }
        }
    });

    let result = StitchPipeline::run(&request, move |event| {
        tx.send(event).ok();
    })
    .await;
    forwarder.await.ok();

    let report = result?;
    info!(
        job_id = %session.job_id(),
        "Stitched output: {}x{}, {:.1}s, {} bytes",
        report.info.width,
        report.info.height,
        report.info.duration,
        report.info.size
    );

    {
        let mut state = session
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.stitched_output = Some(report.output.clone());
    }
    session.save_checkpoint("stitch_complete").await?;

    Ok(report.output)
}

/// Upload the finished output with operation-level retry, then verify it
/// actually landed.
async fn upload(
    session: &JobSession,
    local_output: &std::path::Path,
    output_ref: &str,
) -> WorkerResult<()> {
    session.ensure_not_cancelled().await?;
    session
        .sink
        .stage_started("upload", 90.0, "Uploading stitched output")
        .await;

    let policy = RetryPolicy::new("upload_output");
    retry(&policy, StorageError::is_retryable, || {
        session.ctx.storage.upload_artifact(local_output, output_ref)
    })
    .await?;

    if !session.ctx.storage.exists(output_ref).await? {
        return Err(WorkerError::job_failed(format!(
            "uploaded output {} not visible in storage",
            output_ref
        )));
    }

    session.save_checkpoint("upload_complete").await?;
    session
        .sink
        .stage_completed("upload", 98.0, "Output uploaded")
        .await;

    Ok(())
}
