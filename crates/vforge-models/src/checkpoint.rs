//! Job checkpoints: named, timestamped snapshots of resumable state.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::job::JobId;

/// Stage name reserved for the best-effort checkpoint written on a host
/// shutdown signal. Resume logic prefers the most recent genuine stage
/// checkpoint when this one carries no new information.
pub const SHUTDOWN_STAGE: &str = "shutdown_interrupt";

/// Snapshot of resumable state for a job at a named milestone.
///
/// Checkpoints for a job are totally ordered by `(timestamp, sequence)`;
/// the sequence breaks ties between saves in the same millisecond. The last
/// checkpoint is the authoritative resume point.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Checkpoint {
    /// Owning job
    pub job_id: JobId,

    /// Milestone name (e.g. "download_complete"); one checkpoint per stage,
    /// re-running a stage overwrites it
    pub stage_name: String,

    /// Monotonic per-runner counter, tie-breaker for equal timestamps
    #[serde(default)]
    pub sequence: u64,

    /// Save time
    pub timestamp: DateTime<Utc>,

    /// Opaque resumable state (file lists, partial output paths, ...)
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl Checkpoint {
    /// Create a checkpoint for a stage with the given sequence number.
    pub fn new(job_id: JobId, stage_name: impl Into<String>, sequence: u64) -> Self {
        Self {
            job_id,
            stage_name: stage_name.into(),
            sequence,
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    /// Attach a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// True when this is the shutdown-interrupt checkpoint.
    pub fn is_shutdown(&self) -> bool {
        self.stage_name == SHUTDOWN_STAGE
    }

    /// Read a string list from the data map (e.g. downloaded file paths).
    pub fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.data.get(key).and_then(|v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
        })
    }

    /// Read a string from the data map.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Read an unsigned integer from the data map.
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    /// Ordering key: later checkpoints sort after earlier ones.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}
