//! Firestore REST API client and typed repositories.
//!
//! This crate provides:
//! - Typed repositories for jobs, checkpoints, progress entries, and
//!   project projections
//! - Service account authentication via gcp_auth with token caching
//! - Field-mask merge updates, precondition-guarded corrections, and retry
//!   with exponential backoff

pub mod checkpoint_repo;
pub mod client;
pub mod error;
pub mod job_repo;
pub mod metrics;
pub mod progress_repo;
pub mod project_repo;
pub mod retry;
pub mod token_cache;
pub mod types;

pub use checkpoint_repo::CheckpointRepository;
pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use job_repo::JobRepository;
pub use progress_repo::ProgressRepository;
pub use project_repo::ProjectRepository;
pub use retry::RetryConfig;
pub use types::{Document, FromFirestoreValue, StructuredQuery, ToFirestoreValue, Value};
