//! Generation job pipeline.
//!
//! One clip per prompt, in order. A slot whose clip is already verified in
//! blob storage is skipped, so retries re-run only the missing units of
//! work; the project's clip list is updated per completed clip.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::info;

use vforge_engine::SynthesisRequest;
use vforge_models::{JobOptions, ProjectStatus};
use vforge_storage::{clip_key, StorageError};

use crate::error::{WorkerError, WorkerResult};
use crate::retry::{retry, RetryPolicy};
use crate::runner::JobSession;

pub(crate) async fn run(session: &JobSession) -> WorkerResult<()> {
    let payload = session.payload().clone();
    let JobOptions::Generation(options) = &payload.options else {
        return Err(WorkerError::Validation(
            "generation job carries non-generation options".into(),
        ));
    };

    let total = options.prompts.len();
    let project = session
        .ctx
        .projects
        .get(&payload.project_id)
        .await?
        .ok_or_else(|| {
            WorkerError::Validation(format!("no project record for {}", payload.project_id))
        })?;

    session
        .sink
        .stage_started("generate", 10.0, format!("Generating {} clips", total))
        .await;

    // Completed work comes from two sources of claimed truth: the resume
    // checkpoint and the project's clip list. Both are only trusted after
    // verification against storage.
    let mut completed: BTreeMap<usize, String> = {
        let state = session
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.generated.clone()
    };
    for (index, clip_ref) in project.clip_refs.iter().enumerate() {
        if let Some(clip_ref) = clip_ref {
            completed.entry(index).or_insert_with(|| clip_ref.clone());
        }
    }

    let clips_dir = session.work_dir().join("clips");
    tokio::fs::create_dir_all(&clips_dir).await?;

    let mut generated_now = 0usize;
    for (index, prompt) in options.prompts.iter().enumerate() {
        session.ensure_not_cancelled().await?;

        if let Some(existing) = completed.get(&index) {
            if session.ctx.storage.exists(existing).await.unwrap_or(false) {
                info!(
                    job_id = %session.job_id(),
                    "Clip {} already in storage, skipping", index
                );
                publish_progress(session, index + 1, total, "verified existing clip").await;
                continue;
            }
            // Claimed but missing: treat the slot as not done.
            completed.remove(&index);
        }

        let clip_name = format!("clip_{:02}.mp4", index);
        let local_path = clips_dir.join(&clip_name);

        let request = SynthesisRequest {
            prompt: prompt.clone(),
            duration_secs: options.clip_duration_secs,
            width: options.width,
            height: options.height,
        };
        session.ctx.synthesizer.synthesize(&request, &local_path).await?;

        let clip_ref = clip_key(
            &payload.owner_id,
            payload.project_id.as_str(),
            session.job_id().as_str(),
            &clip_name,
        )?;

        let policy = RetryPolicy::new("upload_clip");
        retry(&policy, StorageError::is_retryable, || {
            session.ctx.storage.upload_artifact(&local_path, &clip_ref)
        })
        .await?;

        session
            .ctx
            .projects
            .set_clip_ref(&payload.project_id, index, &clip_ref)
            .await?;

        completed.insert(index, clip_ref);
        generated_now += 1;
        {
            let mut state = session
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.generated = completed.clone();
        }
        session.save_checkpoint("clips_generated").await?;

        publish_progress(session, index + 1, total, prompt).await;
    }

    session
        .sink
        .stage_completed(
            "generate",
            90.0,
            format!("{} clips generated, {} reused", generated_now, total - generated_now),
        )
        .await;

    session
        .ctx
        .projects
        .set_status(&payload.project_id, ProjectStatus::Ready)
        .await?;

    Ok(())
}

/// Per-clip progress, mapped onto the 10-90 range of the generate stage.
async fn publish_progress(session: &JobSession, done: usize, total: usize, detail: &str) {
    let fraction = done as f64 / total.max(1) as f64;
    let percent = 10.0 + fraction * 80.0;
    session
        .sink
        .publish(
            percent,
            format!("Clip {}/{} done", done, total),
            "generate",
            std::collections::HashMap::from([("prompt".to_string(), json!(detail))]),
        )
        .await;
}

#[cfg(test)]
mod tests {
    #[test]
    fn progress_mapping_spans_generate_range() {
        let percent = |done: usize, total: usize| 10.0 + (done as f64 / total as f64) * 80.0;
        assert!((percent(1, 4) - 30.0).abs() < 0.01);
        assert!((percent(4, 4) - 90.0).abs() < 0.01);
    }
}
