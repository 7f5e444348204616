//! Periodic reconciliation and retention sweep.
//!
//! Runs in the background: corrects non-terminal job records against
//! verified reality, and applies retention to checkpoints, progress logs,
//! and terminal job records.

use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};

use vforge_firestore::{CheckpointRepository, JobRepository, ProgressRepository};

use crate::reconciler::StateReconciler;

/// Interval between sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Terminal records older than this are deleted along with their
/// checkpoints and progress logs.
const DEFAULT_RETENTION_DAYS: i64 = 14;

/// Background sweep service.
pub struct ReconcileSweep {
    jobs: JobRepository,
    checkpoints: CheckpointRepository,
    progress: ProgressRepository,
    reconciler: StateReconciler,
    retention: chrono::Duration,
    enabled: bool,
}

impl ReconcileSweep {
    /// Create a new sweep.
    pub fn new(
        jobs: JobRepository,
        checkpoints: CheckpointRepository,
        progress: ProgressRepository,
        reconciler: StateReconciler,
    ) -> Self {
        let enabled = std::env::var("ENABLE_RECONCILE_SWEEP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let retention_days = std::env::var("JOB_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        Self {
            jobs,
            checkpoints,
            progress,
            reconciler,
            retention: chrono::Duration::days(retention_days),
            enabled,
        }
    }

    /// Run the sweep loop forever. Spawn as a background task.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Reconcile sweep is disabled");
            return;
        }

        info!("Starting reconcile sweep (interval: {:?})", SWEEP_INTERVAL);
        let mut ticker = interval(SWEEP_INTERVAL);

        loop {
            ticker.tick().await;

            if let Err(e) = self.check_once().await {
                error!("Reconcile sweep error: {}", e);
            }
        }
    }

    /// Run a single sweep cycle. Returns (scanned, corrected) counts.
    pub async fn check_once(&self) -> anyhow::Result<(u32, u32)> {
        let mut scanned = 0u32;
        let mut corrected = 0u32;

        for record in self.jobs.list_non_terminal().await? {
            scanned += 1;
            match self.reconciler.reconcile(&record).await {
                Ok(true) => {
                    corrected += 1;
                    // The project's claimed clips may now disagree too.
                    if let Err(e) = self
                        .reconciler
                        .reconcile_project(&record.project_id)
                        .await
                    {
                        warn!(
                            project_id = %record.project_id,
                            "Project reconciliation failed: {}", e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %record.job_id, "Job reconciliation failed: {}", e);
                }
            }
        }

        if corrected > 0 {
            info!(
                "Reconcile sweep: {} scanned, {} corrected",
                scanned, corrected
            );
        }

        self.apply_retention().await?;

        Ok((scanned, corrected))
    }

    /// Delete expired terminal records and their durable trails.
    async fn apply_retention(&self) -> anyhow::Result<u32> {
        let expired = self.jobs.list_terminal_older_than(self.retention).await?;
        let mut deleted = 0u32;

        for record in expired {
            self.checkpoints.delete_all(&record.job_id).await?;
            self.progress.delete_all(&record.job_id).await?;
            self.jobs.delete(&record.job_id).await?;
            deleted += 1;
        }

        if deleted > 0 {
            info!("Retention sweep removed {} expired jobs", deleted);
        }
        Ok(deleted)
    }
}
