//! Progress log entries and the status-polling wire shape.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::job::{JobId, JobStatus};

/// Sentinel percent value marking an error entry. The only permitted
/// decrease in an otherwise monotonically non-decreasing progress series.
pub const ERROR_PERCENT: f64 = -1.0;

/// Number of recent log lines included in a status snapshot.
pub const RECENT_LOG_LINES: usize = 5;

/// One append-only progress event. Never mutated after write.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEntry {
    /// Owning job
    pub job_id: JobId,

    /// Strictly increasing per job; used as the sort key instead of wall
    /// clock to avoid clock-skew reordering
    pub sequence_number: u64,

    /// Emission time
    pub timestamp: DateTime<Utc>,

    /// 0.0-100.0, or `ERROR_PERCENT`
    pub percent: f64,

    /// Human-readable line
    pub message: String,

    /// Pipeline stage that emitted the entry
    pub stage: String,

    /// Free-form extras (fps, speed, eta, error flag, ...)
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ProgressEntry {
    pub fn is_error(&self) -> bool {
        self.percent == ERROR_PERCENT
    }
}

/// Snapshot returned to status-polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressSnapshot {
    /// Job ID
    pub job_id: JobId,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Progress percentage (0.0-100.0, -1.0 on error)
    pub progress_percent: f64,

    /// Stage currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    /// Latest status line
    pub message: String,

    /// Most recent log lines, newest last
    pub recent_log: Vec<String>,

    /// Estimated seconds until completion, when the tool reports speed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_sentinel() {
        let entry = ProgressEntry {
            job_id: JobId::from("j1"),
            sequence_number: 4,
            timestamp: Utc::now(),
            percent: ERROR_PERCENT,
            message: "ffmpeg exited 1".into(),
            stage: "execute".into(),
            metadata: HashMap::new(),
        };
        assert!(entry.is_error());
    }

    #[test]
    fn snapshot_serializes_without_optional_fields() {
        let snapshot = ProgressSnapshot {
            job_id: JobId::from("j1"),
            status: JobStatus::Running,
            progress_percent: 42.0,
            current_stage: None,
            message: "Stitching".into(),
            recent_log: vec!["a".into()],
            estimated_time_remaining_seconds: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("estimated_time_remaining_seconds"));
        assert!(!json.contains("current_stage"));
    }
}
