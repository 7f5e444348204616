//! Shared data models for the VForge job subsystem.
//!
//! This crate defines the durable records (jobs, checkpoints, progress
//! entries, project projections) and the stable wire contracts exchanged
//! with the execution engine and status-polling clients.

pub mod checkpoint;
pub mod job;
pub mod payload;
pub mod progress;
pub mod project;

pub use checkpoint::{Checkpoint, SHUTDOWN_STAGE};
pub use job::{JobError, JobId, JobRecord, JobStatus, JobType};
pub use payload::{
    CompressionTier, GenerationOptions, JobOptions, JobPayload, PayloadError, StitchingOptions,
};
pub use progress::{ProgressEntry, ProgressSnapshot, ERROR_PERCENT, RECENT_LOG_LINES};
pub use project::{ProjectId, ProjectRecord, ProjectStatus};
