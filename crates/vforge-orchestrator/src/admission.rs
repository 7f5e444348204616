//! Distributed admission lock.
//!
//! Concurrent triggers for the same `(project, job_type)` must not both
//! observe "no active job". The reconcile-then-check-then-write sequence in
//! `trigger` runs under a short-lived Redis lock; the staleness sweep backs
//! up the rare case of a lock expiring mid-sequence.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use vforge_models::{JobType, ProjectId};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Compare-and-delete so only the holder releases the lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed admission lock.
pub struct AdmissionLock {
    client: redis::Client,
    ttl: Duration,
}

impl AdmissionLock {
    /// Create a lock manager.
    pub fn new(redis_url: &str, ttl: Duration) -> OrchestratorResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl })
    }

    /// Create from environment variables.
    pub fn from_env() -> OrchestratorResult<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let ttl = Duration::from_secs(
            std::env::var("ADMISSION_LOCK_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        );
        Self::new(&redis_url, ttl)
    }

    fn key(project_id: &ProjectId, job_type: JobType) -> String {
        format!("vforge:admission:{}:{}", project_id, job_type.as_str())
    }

    /// Acquire the lock for one admission sequence. Fails fast when another
    /// trigger holds it: the caller surfaces that as a conflict rather than
    /// waiting.
    pub async fn acquire(
        &self,
        project_id: &ProjectId,
        job_type: JobType,
    ) -> OrchestratorResult<AdmissionGuard> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(project_id, job_type);
        let token = Uuid::new_v4().to_string();

        let acquired: bool = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;

        if !acquired {
            return Err(OrchestratorError::LockUnavailable(format!(
                "admission for {}/{} is in progress",
                project_id,
                job_type.as_str()
            )));
        }

        debug!("Acquired admission lock {}", key);
        Ok(AdmissionGuard { conn, key, token })
    }
}

/// Held admission lock. Release explicitly; an unreleased guard expires
/// with the TTL.
pub struct AdmissionGuard {
    conn: redis::aio::MultiplexedConnection,
    key: String,
    token: String,
}

impl AdmissionGuard {
    /// Release the lock if we still hold it.
    pub async fn release(mut self) {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let result: Result<i32, _> = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await;

        match result {
            Ok(1) => debug!("Released admission lock {}", self.key),
            Ok(_) => warn!("Admission lock {} expired before release", self.key),
            Err(e) => warn!("Failed to release admission lock {}: {}", self.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_scoped_per_project_and_type() {
        let a = AdmissionLock::key(&ProjectId::from("p1"), JobType::Stitching);
        let b = AdmissionLock::key(&ProjectId::from("p1"), JobType::Generation);
        let c = AdmissionLock::key(&ProjectId::from("p2"), JobType::Stitching);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("vforge:admission:"));
    }
}
