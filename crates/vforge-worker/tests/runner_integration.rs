//! Runner integration tests.
//!
//! Run with `cargo test -- --ignored` and live Firestore credentials.

use vforge_firestore::{
    CheckpointRepository, FirestoreClient, JobRepository, ProgressRepository,
};
use vforge_models::{
    Checkpoint, JobId, JobOptions, JobPayload, JobRecord, JobType, ProjectId, StitchingOptions,
    ERROR_PERCENT,
};
use vforge_worker::{ProgressSink, ResumableState};

fn test_record(job_id: &JobId) -> JobRecord {
    let payload = JobPayload {
        job_id: job_id.clone(),
        project_id: ProjectId::new(),
        owner_id: "integration-test".to_string(),
        input_refs: vec!["a.mp4".into(), "b.mp4".into()],
        output_ref: format!("media/it/{}/outputs/{}/final.mp4", job_id, job_id),
        options: JobOptions::Stitching(StitchingOptions::default()),
        retry_attempt: 0,
    };
    JobRecord::new(JobType::Stitching, "integration-test", payload)
}

/// Published percents are monotonically non-decreasing except the error
/// sentinel, and sequence numbers are gap-free.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_progress_sink_monotonic_sequencing() {
    dotenvy::dotenv().ok();

    let firestore = FirestoreClient::from_env().await.expect("firestore");
    let jobs = JobRepository::new(firestore.clone());
    let log = ProgressRepository::new(firestore);

    let job_id = JobId::new();
    jobs.create(&test_record(&job_id)).await.expect("create");

    let sink = ProgressSink::new(job_id.clone(), jobs.clone(), log.clone()).await;

    sink.stage_started("download", 10.0, "Downloading").await;
    sink.stage_completed("download", 40.0, "Downloaded").await;
    // Regressing percent is clamped, not written.
    sink.publish(25.0, "late update", "execute", Default::default())
        .await;
    sink.tool_progress(30.0, 60.0, 48.0, 1.5).await;
    sink.error("execute", "tool exited 1").await;

    let entries = log.recent(&job_id, 10).await.expect("recent");
    assert_eq!(entries.len(), 5);

    let sequences: Vec<u64> = entries.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    let percents: Vec<f64> = entries.iter().map(|e| e.percent).collect();
    assert_eq!(percents[2], 40.0, "regression must clamp to the high-water mark");
    assert!(percents[3] >= 40.0 && percents[3] <= 90.0);
    assert_eq!(percents[4], ERROR_PERCENT);
    assert!(entries[4].metadata.get("error").is_some());

    // Ordered prefix (ignoring the sentinel) is non-decreasing.
    assert!(percents[..4].windows(2).all(|w| w[0] <= w[1]));

    log.delete_all(&job_id).await.ok();
    jobs.delete(&job_id).await.ok();
}

/// A retry attempt restores downloaded paths from the last checkpoint and
/// drops anything that no longer exists on disk.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_resume_restores_checkpointed_downloads() {
    dotenvy::dotenv().ok();

    let firestore = FirestoreClient::from_env().await.expect("firestore");
    let checkpoints = CheckpointRepository::new(firestore);
    let job_id = JobId::new();

    // Simulate the first attempt: three inputs downloaded, two still on
    // disk when the retry lands on this host.
    let dir = tempfile::TempDir::new().unwrap();
    let kept_a = dir.path().join("input_000_a.mp4");
    let kept_b = dir.path().join("input_001_b.mp4");
    tokio::fs::write(&kept_a, b"a").await.unwrap();
    tokio::fs::write(&kept_b, b"b").await.unwrap();
    let lost = dir.path().join("input_002_c.mp4");

    let checkpoint = Checkpoint::new(job_id.clone(), "download_complete", 0).with_data(
        "downloaded",
        serde_json::json!([
            kept_a.to_string_lossy(),
            kept_b.to_string_lossy(),
            lost.to_string_lossy()
        ]),
    );
    checkpoints.save(&checkpoint).await.expect("save");

    let last = checkpoints
        .get_last(&job_id)
        .await
        .expect("get_last")
        .expect("checkpoint exists");
    assert_eq!(last.stage_name, "download_complete");

    let mut state = ResumableState::from_checkpoint(&last);
    assert_eq!(state.downloaded.len(), 3);

    state.verify_local_artifacts();
    assert_eq!(state.downloaded, vec![kept_a, kept_b]);

    checkpoints.delete_all(&job_id).await.ok();
}
