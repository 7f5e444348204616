//! Per-job runner executed by the managed execution service.
//!
//! This crate provides:
//! - The JobRunner state machine (parse → init → resume-or-start →
//!   stages → finalize)
//! - Checkpoint-gated stage skipping and shutdown checkpointing
//! - The durable ProgressSink
//! - Per-type pipelines for stitching and generation jobs

pub mod config;
pub mod error;
mod generation;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod runner;
mod stitching;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use progress::ProgressSink;
pub use runner::{JobRunner, JobSession, ResumableState, RunnerContext};
