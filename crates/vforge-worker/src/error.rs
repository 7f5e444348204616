//! Worker error types.

use thiserror::Error;

use vforge_models::{JobError, PayloadError};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Too few usable inputs: need {needed}, have {available}")]
    ResourceInsufficient { needed: usize, available: usize },

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Interrupted by shutdown signal")]
    Interrupted,

    #[error("Storage error: {0}")]
    Storage(#[from] vforge_storage::StorageError),

    #[error("Firestore error: {0}")]
    Firestore(#[from] vforge_firestore::FirestoreError),

    #[error("Media error: {0}")]
    Media(#[from] vforge_media::MediaError),

    #[error("Engine error: {0}")]
    Engine(#[from] vforge_engine::EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PayloadError> for WorkerError {
    fn from(e: PayloadError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    /// Stable machine-readable code recorded on the job record.
    pub fn code(&self) -> &'static str {
        use vforge_media::MediaError;
        match self {
            WorkerError::Validation(_) => "validation",
            WorkerError::ResourceInsufficient { .. } => "resource_insufficient",
            WorkerError::Media(MediaError::TooFewInputs { .. }) => "resource_insufficient",
            WorkerError::Media(MediaError::Timeout(_)) => "timeout",
            WorkerError::Media(_) => "external_tool",
            WorkerError::Storage(_) => "storage",
            WorkerError::Firestore(_) => "storage",
            WorkerError::Engine(_) => "synthesis",
            WorkerError::Cancelled => "cancelled",
            WorkerError::Interrupted => "interrupted",
            WorkerError::Io(_) => "io",
            WorkerError::JobFailed(_) => "job_failed",
        }
    }

    /// Structured error for the job record.
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.code(), self.to_string())
    }

    /// Transient failures worth retrying at the operation level.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Firestore(e) => e.is_retryable(),
            WorkerError::Engine(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vforge_media::MediaError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(WorkerError::Validation("x".into()).code(), "validation");
        assert_eq!(
            WorkerError::ResourceInsufficient {
                needed: 2,
                available: 1
            }
            .code(),
            "resource_insufficient"
        );
        assert_eq!(
            WorkerError::Media(MediaError::ffmpeg_failed("exit 1", None, Some(1))).code(),
            "external_tool"
        );
        assert_eq!(WorkerError::Media(MediaError::Timeout(600)).code(), "timeout");
        assert_eq!(WorkerError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn payload_errors_become_validation() {
        let payload_err =
            vforge_models::JobPayload::from_json("{").expect_err("malformed must fail");
        let worker_err: WorkerError = payload_err.into();
        assert_eq!(worker_err.code(), "validation");
    }
}
