//! Control-plane integration tests.
//!
//! These exercise admission, reconciliation, and cancellation against live
//! Firestore/R2/Redis, with the execution engine stubbed in-process. Run
//! with `cargo test -- --ignored` and the service environment set.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use vforge_engine::{EngineResult, ExecutionEngine, ExecutionRef, ExecutionStatus};
use vforge_firestore::{
    FirestoreClient, JobRepository, ProgressRepository, ProjectRepository,
};
use vforge_models::{
    JobId, JobOptions, JobPayload, JobRecord, JobStatus, JobType, ProjectId, StitchingOptions,
};
use vforge_orchestrator::{
    AdmissionLock, JobOrchestrator, OrchestratorConfig, OrchestratorError, StateReconciler,
};
use vforge_storage::R2Client;

/// Engine double: accepts every dispatch, reports a fixed status.
struct StubEngine {
    dispatched: AtomicU32,
    status: ExecutionStatus,
}

impl StubEngine {
    fn new(status: ExecutionStatus) -> Self {
        Self {
            dispatched: AtomicU32::new(0),
            status,
        }
    }
}

#[async_trait]
impl ExecutionEngine for StubEngine {
    async fn run(
        &self,
        job_id: &JobId,
        _job_type: JobType,
        _payload: &JobPayload,
    ) -> EngineResult<ExecutionRef> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionRef(format!("stub-exec-{}", job_id)))
    }

    async fn status(&self, _execution_ref: &ExecutionRef) -> EngineResult<ExecutionStatus> {
        Ok(self.status)
    }
}

async fn orchestrator_with(engine: Arc<dyn ExecutionEngine>) -> JobOrchestrator {
    dotenvy::dotenv().ok();

    let config = OrchestratorConfig::from_env();
    let firestore = FirestoreClient::from_env().await.expect("firestore");
    let storage = R2Client::from_env().await.expect("storage");
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let admission = AdmissionLock::new(&redis_url, config.lock_ttl).expect("lock");

    JobOrchestrator::new(
        JobRepository::new(firestore.clone()),
        ProjectRepository::new(firestore.clone()),
        ProgressRepository::new(firestore),
        storage,
        engine,
        admission,
        config,
    )
}

fn stitch_options() -> JobOptions {
    JobOptions::Stitching(StitchingOptions::default())
}

fn unique_project() -> ProjectId {
    ProjectId::new()
}

/// At most one record is admitted per (project, type) under concurrent
/// triggers.
#[tokio::test]
#[ignore = "requires Firestore and Redis"]
async fn test_concurrent_triggers_admit_one() {
    let engine = Arc::new(StubEngine::new(ExecutionStatus::Running));
    let orchestrator = Arc::new(orchestrator_with(engine.clone()).await);
    let project_id = unique_project();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let orchestrator = Arc::clone(&orchestrator);
        let project_id = project_id.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .trigger(
                    &project_id,
                    "integration-test",
                    JobType::Stitching,
                    vec!["media/it/in/a.mp4".into(), "media/it/in/b.mp4".into()],
                    stitch_options(),
                    false,
                )
                .await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => admitted += 1,
            Err(OrchestratorError::AlreadyRunning { .. })
            | Err(OrchestratorError::LockUnavailable(_)) => rejected += 1,
            Err(e) => panic!("unexpected trigger error: {}", e),
        }
    }

    assert_eq!(admitted, 1, "exactly one trigger must win admission");
    assert_eq!(rejected, 4);
    assert_eq!(engine.dispatched.load(Ordering::SeqCst), 1);
}

/// Re-triggering while running rejects; after completion it is a no-op
/// success returning the completed record.
#[tokio::test]
#[ignore = "requires Firestore and Redis"]
async fn test_retrigger_semantics() {
    let engine = Arc::new(StubEngine::new(ExecutionStatus::Running));
    let orchestrator = orchestrator_with(engine).await;
    let project_id = unique_project();

    let record = orchestrator
        .trigger(
            &project_id,
            "integration-test",
            JobType::Stitching,
            vec!["media/it/in/a.mp4".into(), "media/it/in/b.mp4".into()],
            stitch_options(),
            false,
        )
        .await
        .expect("first trigger");

    // Second trigger while queued/running is rejected.
    let second = orchestrator
        .trigger(
            &project_id,
            "integration-test",
            JobType::Stitching,
            vec!["media/it/in/a.mp4".into(), "media/it/in/b.mp4".into()],
            stitch_options(),
            false,
        )
        .await;
    assert!(matches!(
        second,
        Err(OrchestratorError::AlreadyRunning { .. })
    ));

    // Simulate the runner finishing, then re-trigger: no-op success.
    let firestore = FirestoreClient::from_env().await.expect("firestore");
    let jobs = JobRepository::new(firestore);
    jobs.complete(&record.job_id).await.expect("complete");

    let third = orchestrator
        .trigger(
            &project_id,
            "integration-test",
            JobType::Stitching,
            vec!["media/it/in/a.mp4".into(), "media/it/in/b.mp4".into()],
            stitch_options(),
            false,
        )
        .await
        .expect("no-op trigger");
    assert_eq!(third.job_id, record.job_id);
    assert_eq!(third.status, JobStatus::Completed);

    jobs.delete(&record.job_id).await.ok();
}

/// A record whose declared output exists in storage reconciles to
/// completed regardless of its recorded status.
#[tokio::test]
#[ignore = "requires Firestore and R2"]
async fn test_reconcile_verified_output() {
    dotenvy::dotenv().ok();

    let firestore = FirestoreClient::from_env().await.expect("firestore");
    let storage = R2Client::from_env().await.expect("storage");
    let jobs = JobRepository::new(firestore.clone());
    let projects = ProjectRepository::new(firestore);

    // Job record claims running, but its output is already in storage.
    let job_id = JobId::new();
    let output_ref = format!("media/it/recon/outputs/{}/final.mp4", job_id);
    let payload = JobPayload {
        job_id: job_id.clone(),
        project_id: ProjectId::new(),
        owner_id: "integration-test".to_string(),
        input_refs: vec!["a".into(), "b".into()],
        output_ref: output_ref.clone(),
        options: stitch_options(),
        retry_attempt: 0,
    };
    let record = JobRecord::new(JobType::Stitching, "integration-test", payload);
    jobs.create(&record).await.expect("create");
    jobs.mark_running(&job_id).await.expect("mark running");

    let dir = tempfile::TempDir::new().unwrap();
    let local = dir.path().join("final.mp4");
    tokio::fs::write(&local, b"finished output").await.unwrap();
    storage.upload_artifact(&local, &output_ref).await.expect("upload");

    let reconciler = StateReconciler::new(
        jobs.clone(),
        projects,
        storage.clone(),
        Arc::new(StubEngine::new(ExecutionStatus::Failed)),
        chrono::Duration::minutes(30),
    );

    let running = jobs.get(&job_id).await.expect("get").expect("exists");
    let corrected = reconciler.reconcile(&running).await.expect("reconcile");
    assert!(corrected);

    let fresh = jobs.get(&job_id).await.expect("get").expect("exists");
    assert_eq!(fresh.status, JobStatus::Completed);
    assert!((fresh.progress - 100.0).abs() < f64::EPSILON);

    // Idempotent: a second pass changes nothing.
    assert!(!reconciler.reconcile(&fresh).await.expect("reconcile"));

    storage.delete_object(&output_ref).await.ok();
    jobs.delete(&job_id).await.ok();
}

/// Cancel is ownership-checked and a no-op on terminal records.
#[tokio::test]
#[ignore = "requires Firestore and Redis"]
async fn test_cancel_semantics() {
    let engine = Arc::new(StubEngine::new(ExecutionStatus::Running));
    let orchestrator = orchestrator_with(engine).await;
    let project_id = unique_project();

    let record = orchestrator
        .trigger(
            &project_id,
            "integration-test",
            JobType::Stitching,
            vec!["media/it/in/a.mp4".into(), "media/it/in/b.mp4".into()],
            stitch_options(),
            false,
        )
        .await
        .expect("trigger");

    let denied = orchestrator.cancel(&record.job_id, "someone-else").await;
    assert!(matches!(
        denied,
        Err(OrchestratorError::PermissionDenied(_))
    ));

    let cancelled = orchestrator
        .cancel(&record.job_id, "integration-test")
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // Terminal: cancelling again is a no-op success.
    let again = orchestrator
        .cancel(&record.job_id, "integration-test")
        .await
        .expect("cancel again");
    assert_eq!(again.status, JobStatus::Cancelled);

    let firestore = FirestoreClient::from_env().await.expect("firestore");
    JobRepository::new(firestore).delete(&record.job_id).await.ok();
}
