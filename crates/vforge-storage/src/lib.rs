//! R2-compatible blob storage client and batch operations.
//!
//! This crate provides:
//! - S3-compatible client for Cloudflare R2 (upload, download, delete, list)
//! - Idempotent deletes and HEAD-based object info
//! - Batch validation/download with bounded concurrency
//! - The fixed object key hierarchy for job artifacts

pub mod client;
pub mod error;
pub mod operations;
pub mod paths;

pub use client::{ObjectInfo, R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use operations::{local_input_name, RefDownload, RefValidation};
pub use paths::{clip_key, job_prefix, output_key, project_prefix, stage_key, ArtifactKind};
