//! Firestore integration tests.
//!
//! Run against a live project with `cargo test -- --ignored` and
//! GOOGLE_APPLICATION_CREDENTIALS / GCP_PROJECT_ID set.

use chrono::Duration;

use vforge_firestore::{
    CheckpointRepository, FirestoreClient, JobRepository, ProgressRepository,
};
use vforge_models::{
    Checkpoint, JobId, JobOptions, JobPayload, JobRecord, JobStatus, JobType, ProgressEntry,
    ProjectId, StitchingOptions,
};

fn test_record() -> JobRecord {
    let job_id = JobId::new();
    let payload = JobPayload {
        job_id: job_id.clone(),
        project_id: ProjectId::from_string(format!("it-{}", job_id)),
        owner_id: "integration-test".to_string(),
        input_refs: vec!["a.mp4".into(), "b.mp4".into()],
        output_ref: format!("media/it/{}/outputs/{}/final.mp4", job_id, job_id),
        options: JobOptions::Stitching(StitchingOptions::default()),
        retry_attempt: 0,
    };
    JobRecord::new(JobType::Stitching, "integration-test", payload)
}

/// Create, read back, transition, and delete a job record.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_job_record_lifecycle() {
    dotenvy::dotenv().ok();

    let client = FirestoreClient::from_env().await.expect("client");
    let repo = JobRepository::new(client);
    let record = test_record();
    let job_id = record.job_id.clone();

    repo.create(&record).await.expect("create");

    let fetched = repo.get(&job_id).await.expect("get").expect("record exists");
    assert_eq!(fetched.status, JobStatus::Queued);
    assert_eq!(fetched.payload.input_refs.len(), 2);

    repo.mark_running(&job_id).await.expect("mark running");
    repo.complete(&job_id).await.expect("complete");

    let done = repo.get(&job_id).await.expect("get").expect("record exists");
    assert_eq!(done.status, JobStatus::Completed);
    assert!((done.progress - 100.0).abs() < f64::EPSILON);

    repo.delete(&job_id).await.expect("delete");
    assert!(repo.get(&job_id).await.expect("get").is_none());
}

/// Checkpoints upsert per stage and resume from the latest.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_checkpoint_ordering_and_upsert() {
    dotenvy::dotenv().ok();

    let client = FirestoreClient::from_env().await.expect("client");
    let repo = CheckpointRepository::new(client);
    let job_id = JobId::new();

    let first = Checkpoint::new(job_id.clone(), "download_complete", 0)
        .with_data("files", serde_json::json!(["/tmp/a.mp4"]));
    repo.save(&first).await.expect("save first");

    let second = Checkpoint::new(job_id.clone(), "stitch_complete", 1)
        .with_data("output", serde_json::json!("/tmp/out.mp4"));
    repo.save(&second).await.expect("save second");

    // Re-running the download stage overwrites its checkpoint but does not
    // change the resume point.
    let redo = Checkpoint::new(job_id.clone(), "download_complete", 2)
        .with_data("files", serde_json::json!(["/tmp/a.mp4", "/tmp/b.mp4"]));
    repo.save(&redo).await.expect("save redo");

    let all = repo.get_all(&job_id).await.expect("get_all");
    assert_eq!(all.len(), 2, "stage upsert must not duplicate");

    let last = repo.get_last(&job_id).await.expect("get_last").expect("some");
    assert_eq!(last.stage_name, "download_complete");
    assert_eq!(last.sequence, 2);

    let deleted = repo.delete_all(&job_id).await.expect("delete_all");
    assert_eq!(deleted, 2);
    assert!(repo.get_last(&job_id).await.expect("get_last").is_none());
}

/// Retention deletes only old checkpoints.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_checkpoint_retention() {
    dotenvy::dotenv().ok();

    let client = FirestoreClient::from_env().await.expect("client");
    let repo = CheckpointRepository::new(client);
    let job_id = JobId::new();

    let mut old = Checkpoint::new(job_id.clone(), "download_complete", 0);
    old.timestamp = chrono::Utc::now() - Duration::days(30);
    repo.save(&old).await.expect("save old");

    let fresh = Checkpoint::new(job_id.clone(), "stitch_complete", 1);
    repo.save(&fresh).await.expect("save fresh");

    let deleted = repo
        .delete_older_than(&job_id, Duration::days(7))
        .await
        .expect("retention");
    assert_eq!(deleted, 1);

    let remaining = repo.get_all(&job_id).await.expect("get_all");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].stage_name, "stitch_complete");

    repo.delete_all(&job_id).await.ok();
}

/// Progress entries keep strictly increasing, gap-free sequence numbers.
#[tokio::test]
#[ignore = "requires Firestore"]
async fn test_progress_log_ordering() {
    dotenvy::dotenv().ok();

    let client = FirestoreClient::from_env().await.expect("client");
    let repo = ProgressRepository::new(client);
    let job_id = JobId::new();

    for (seq, percent) in [(0u64, 5.0), (1, 10.0), (2, 40.0), (3, 65.0), (4, 90.0), (5, 100.0)] {
        let entry = ProgressEntry {
            job_id: job_id.clone(),
            sequence_number: seq,
            timestamp: chrono::Utc::now(),
            percent,
            message: format!("step {}", seq),
            stage: "execute".to_string(),
            metadata: Default::default(),
        };
        repo.append(&entry).await.expect("append");
    }

    assert_eq!(
        repo.latest_sequence(&job_id).await.expect("latest"),
        Some(5)
    );

    let recent = repo.recent(&job_id, 5).await.expect("recent");
    assert_eq!(recent.len(), 5);
    let sequences: Vec<u64> = recent.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    // Percent is non-decreasing across the retained window.
    assert!(recent.windows(2).all(|w| w[0].percent <= w[1].percent));

    repo.delete_all(&job_id).await.ok();
}
