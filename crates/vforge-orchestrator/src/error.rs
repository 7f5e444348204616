//! Control-plane error types with stable codes.

use thiserror::Error;

use vforge_models::JobId;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("A {job_type} job is already running for this project (job {job_id})")]
    AlreadyRunning { job_id: JobId, job_type: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Admission lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vforge_storage::StorageError),

    #[error("Firestore error: {0}")]
    Firestore(#[from] vforge_firestore::FirestoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] vforge_engine::EngineError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Stable code surfaced to synchronous callers.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AlreadyRunning { .. } => "already_running",
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::PermissionDenied(_) => "permission_denied",
            OrchestratorError::DispatchFailed(_) => "dispatch_failed",
            OrchestratorError::LockUnavailable(_) => "lock_unavailable",
            OrchestratorError::Storage(_) => "storage",
            OrchestratorError::Firestore(_) => "storage",
            OrchestratorError::Engine(_) => "engine",
            OrchestratorError::Redis(_) => "lock_unavailable",
        }
    }
}
