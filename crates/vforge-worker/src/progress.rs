//! Progress sink: the runner's one outlet for progress reporting.
//!
//! Each publish appends an entry to the ordered log and refreshes the
//! denormalized latest fields on the job record. Publishing is best-effort
//! by contract: a monitoring failure is logged and swallowed, never turning
//! a working job into a failed one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use vforge_firestore::{JobRepository, ProgressRepository};
use vforge_models::{JobId, ProgressEntry, ERROR_PERCENT};

/// Sub-range of overall job progress reserved for the external tool's
/// execute stage.
pub const TOOL_PROGRESS_FLOOR: f64 = 40.0;
pub const TOOL_PROGRESS_CEIL: f64 = 90.0;

/// Durable progress sink for one job. Single writer per job: the owning
/// runner allocates sequence numbers from memory after seeding from the
/// store.
pub struct ProgressSink {
    job_id: JobId,
    jobs: JobRepository,
    log: ProgressRepository,
    next_sequence: AtomicU64,
    last_percent: Mutex<f64>,
}

impl ProgressSink {
    /// Create a sink, seeding the sequence counter past anything a prior
    /// attempt wrote.
    pub async fn new(job_id: JobId, jobs: JobRepository, log: ProgressRepository) -> Self {
        let next_sequence = match log.latest_sequence(&job_id).await {
            Ok(Some(latest)) => latest + 1,
            Ok(None) => 0,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to seed progress sequence, starting at 0: {}", e);
                0
            }
        };

        Self {
            job_id,
            jobs,
            log,
            next_sequence: AtomicU64::new(next_sequence),
            last_percent: Mutex::new(0.0),
        }
    }

    /// Append an entry and refresh the job's latest fields. Never fails.
    pub async fn publish(
        &self,
        percent: f64,
        message: impl Into<String>,
        stage: &str,
        metadata: HashMap<String, Value>,
    ) {
        let message = message.into();
        let percent = self.clamp_monotonic(percent);
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        let entry = ProgressEntry {
            job_id: self.job_id.clone(),
            sequence_number,
            timestamp: Utc::now(),
            percent,
            message: message.clone(),
            stage: stage.to_string(),
            metadata,
        };

        if let Err(e) = self.log.append(&entry).await {
            warn!(job_id = %self.job_id, "Failed to append progress entry: {}", e);
        }
        if let Err(e) = self
            .jobs
            .update_latest_progress(&self.job_id, percent, &message, stage)
            .await
        {
            warn!(job_id = %self.job_id, "Failed to update latest progress: {}", e);
        }
    }

    /// Percent is monotonically non-decreasing within a job, except the
    /// error sentinel.
    fn clamp_monotonic(&self, percent: f64) -> f64 {
        if percent == ERROR_PERCENT {
            return ERROR_PERCENT;
        }
        let mut last = self
            .last_percent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let clamped = percent.clamp(*last, 100.0);
        *last = clamped;
        clamped
    }

    /// Mark a stage as started.
    pub async fn stage_started(&self, stage: &str, percent: f64, message: impl Into<String>) {
        self.publish(percent, message, stage, HashMap::new()).await;
    }

    /// Mark a stage as completed.
    pub async fn stage_completed(&self, stage: &str, percent: f64, message: impl Into<String>) {
        self.publish(
            percent,
            message,
            stage,
            HashMap::from([("stage_completed".to_string(), json!(true))]),
        )
        .await;
    }

    /// Record an error entry with the sentinel percent.
    pub async fn error(&self, stage: &str, message: impl Into<String>) {
        self.publish(
            ERROR_PERCENT,
            message,
            stage,
            HashMap::from([("error".to_string(), json!(true))]),
        )
        .await;
    }

    /// Forward external-tool progress, mapping elapsed/total onto the
    /// execute stage's sub-range and computing an ETA when the tool reports
    /// a usable speed.
    pub async fn tool_progress(
        &self,
        out_time_secs: f64,
        total_duration_secs: f64,
        fps: f64,
        speed: f64,
    ) {
        let percent = map_tool_percent(out_time_secs, total_duration_secs);

        let mut metadata = HashMap::from([
            ("fps".to_string(), json!(fps)),
            ("speed".to_string(), json!(speed)),
        ]);

        if speed > 0.0 {
            let remaining = (total_duration_secs - out_time_secs).max(0.0);
            metadata.insert("eta_seconds".to_string(), json!(remaining / speed));
        }

        self.publish(
            percent,
            format!("Encoding {:.0}s / {:.0}s", out_time_secs, total_duration_secs),
            "execute",
            metadata,
        )
        .await;
    }
}

/// Map tool-reported elapsed time onto the [40, 90] overall range.
pub fn map_tool_percent(out_time_secs: f64, total_duration_secs: f64) -> f64 {
    if total_duration_secs <= 0.0 {
        return TOOL_PROGRESS_FLOOR;
    }
    let fraction = (out_time_secs / total_duration_secs).clamp(0.0, 1.0);
    TOOL_PROGRESS_FLOOR + fraction * (TOOL_PROGRESS_CEIL - TOOL_PROGRESS_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_percent_maps_into_subrange() {
        assert!((map_tool_percent(0.0, 100.0) - 40.0).abs() < 0.01);
        assert!((map_tool_percent(50.0, 100.0) - 65.0).abs() < 0.01);
        assert!((map_tool_percent(100.0, 100.0) - 90.0).abs() < 0.01);
        // Over-reporting clamps at the stage ceiling.
        assert!((map_tool_percent(150.0, 100.0) - 90.0).abs() < 0.01);
        // Unknown total pins to the stage floor.
        assert!((map_tool_percent(10.0, 0.0) - 40.0).abs() < 0.01);
    }
}
