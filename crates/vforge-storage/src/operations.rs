//! Batch blob operations for job pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::client::R2Client;
use crate::error::StorageResult;

/// Outcome of validating a list of input refs.
///
/// Individual object failures are isolated: one missing input never aborts
/// validation of the others. The caller decides whether the valid subset is
/// sufficient.
#[derive(Debug, Clone, Default)]
pub struct RefValidation {
    /// Refs verified to exist, in input order
    pub valid: Vec<String>,
    /// Refs that are missing or unreadable, in input order
    pub missing: Vec<String>,
}

impl RefValidation {
    pub fn valid_count(&self) -> usize {
        self.valid.len()
    }
}

/// Outcome of downloading one ref in a batch.
#[derive(Debug, Clone)]
pub struct RefDownload {
    /// Source object key
    pub source_ref: String,
    /// Local destination, present on success
    pub local_path: Option<PathBuf>,
}

impl RefDownload {
    pub fn succeeded(&self) -> bool {
        self.local_path.is_some()
    }
}

/// Collision-proof local filename for a downloaded input.
///
/// Two inputs may share a basename, so the index is always part of the
/// local name.
pub fn local_input_name(index: usize, source_ref: &str) -> String {
    let basename = source_ref
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("input.bin");
    format!("input_{:03}_{}", index, basename)
}

impl R2Client {
    /// Verify each ref exists, partitioning into valid and missing.
    pub async fn validate_refs(&self, refs: &[String]) -> RefValidation {
        let mut validation = RefValidation::default();

        for object_ref in refs {
            match self.exists(object_ref).await {
                Ok(true) => validation.valid.push(object_ref.clone()),
                Ok(false) => {
                    warn!("Input ref missing from storage: {}", object_ref);
                    validation.missing.push(object_ref.clone());
                }
                Err(e) => {
                    // Unreadable counts as missing; the others still validate.
                    warn!("Failed to check input ref {}: {}", object_ref, e);
                    validation.missing.push(object_ref.clone());
                }
            }
        }

        info!(
            "Validated {} refs: {} present, {} missing",
            refs.len(),
            validation.valid.len(),
            validation.missing.len()
        );
        validation
    }

    /// Download each ref into `dest_dir` with bounded concurrency.
    ///
    /// Results are returned in input order; a failed download yields an
    /// entry with no local path rather than aborting the batch.
    pub async fn download_refs(
        &self,
        refs: &[String],
        dest_dir: &Path,
        max_parallel: usize,
    ) -> StorageResult<Vec<RefDownload>> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));

        let tasks = refs.iter().enumerate().map(|(index, object_ref)| {
            let client = self.clone();
            let object_ref = object_ref.clone();
            let local_path = dest_dir.join(local_input_name(index, &object_ref));
            let semaphore = Arc::clone(&semaphore);

            async move {
                let _permit = semaphore.acquire().await;
                match client.download_file(&object_ref, &local_path).await {
                    Ok(()) => RefDownload {
                        source_ref: object_ref,
                        local_path: Some(local_path),
                    },
                    Err(e) => {
                        warn!("Failed to download {}: {}", object_ref, e);
                        RefDownload {
                            source_ref: object_ref,
                            local_path: None,
                        }
                    }
                }
            }
        });

        Ok(join_all(tasks).await)
    }

    /// Content type derived from a filename extension.
    pub fn content_type_for(filename: &str) -> &'static str {
        let lower = filename.to_lowercase();
        if lower.ends_with(".mp4") {
            "video/mp4"
        } else if lower.ends_with(".webm") {
            "video/webm"
        } else if lower.ends_with(".mov") {
            "video/quicktime"
        } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            "image/jpeg"
        } else if lower.ends_with(".json") {
            "application/json"
        } else {
            "application/octet-stream"
        }
    }

    /// Upload a finished artifact, inferring the content type from the key.
    pub async fn upload_artifact(&self, path: impl AsRef<Path>, key: &str) -> StorageResult<()> {
        let content_type = Self::content_type_for(key);
        self.upload_file(path, key, content_type).await
    }
}
