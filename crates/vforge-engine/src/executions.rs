//! Managed execution service client.
//!
//! The control plane dispatches jobs here and polls execution verdicts
//! during reconciliation. The service itself is opaque: it runs a worker
//! container with the payload in its environment.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vforge_models::{JobId, JobPayload, JobType};

use crate::error::{EngineError, EngineResult};

/// Opaque handle to a dispatched execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRef(pub String);

impl ExecutionRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verdict reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

/// The execution engine as the orchestrator sees it.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Start a unit of work. Returns the engine's handle for it.
    async fn run(
        &self,
        job_id: &JobId,
        job_type: JobType,
        payload: &JobPayload,
    ) -> EngineResult<ExecutionRef>;

    /// Current verdict for a dispatched execution.
    async fn status(&self, execution_ref: &ExecutionRef) -> EngineResult<ExecutionStatus>;
}

/// Configuration for the HTTP execution client.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Base URL of the execution service
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Max transport retries
    pub max_retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8100".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
        }
    }
}

impl ExecutionConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("EXECUTION_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8100".to_string()),
            timeout: Duration::from_secs(
                std::env::var("EXECUTION_SERVICE_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_retries: std::env::var("EXECUTION_SERVICE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunExecutionRequest<'a> {
    job_id: &'a str,
    job_type: &'a str,
    payload: &'a JobPayload,
}

#[derive(Debug, Deserialize)]
struct RunExecutionResponse {
    execution_ref: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionStatusResponse {
    status: ExecutionStatus,
}

/// HTTP client for the execution service.
pub struct ExecutionClient {
    http: reqwest::Client,
    config: ExecutionConfig,
}

impl ExecutionClient {
    /// Create a new client.
    pub fn new(config: ExecutionConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EngineError::Network)?;
        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::new(ExecutionConfig::from_env())
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Execution service request failed (attempt {}): {}",
                        attempt, e
                    );
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for ExecutionClient {
    async fn run(
        &self,
        job_id: &JobId,
        job_type: JobType,
        payload: &JobPayload,
    ) -> EngineResult<ExecutionRef> {
        let url = format!("{}/v1/executions", self.config.base_url);
        let request = RunExecutionRequest {
            job_id: job_id.as_str(),
            job_type: job_type.as_str(),
            payload,
        };

        debug!(job_id = %job_id, "Dispatching execution to {}", url);

        let response = self
            .with_retry(|| async {
                let response = self.http.post(&url).json(&request).send().await?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(EngineError::request_failed(format!(
                        "execution service returned {}: {}",
                        status, body
                    )));
                }
                let parsed: RunExecutionResponse = response.json().await?;
                Ok(parsed)
            })
            .await?;

        Ok(ExecutionRef(response.execution_ref))
    }

    async fn status(&self, execution_ref: &ExecutionRef) -> EngineResult<ExecutionStatus> {
        let url = format!(
            "{}/v1/executions/{}",
            self.config.base_url,
            execution_ref.as_str()
        );

        self.with_retry(|| async {
            let response = self.http.get(&url).send().await?;
            match response.status().as_u16() {
                200 => {
                    let parsed: ExecutionStatusResponse = response.json().await?;
                    Ok(parsed.status)
                }
                404 => Err(EngineError::NotFound(execution_ref.to_string())),
                status => {
                    let body = response.text().await.unwrap_or_default();
                    Err(EngineError::request_failed(format!(
                        "execution service returned {}: {}",
                        status, body
                    )))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vforge_models::{JobOptions, ProjectId, StitchingOptions};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> JobPayload {
        JobPayload {
            job_id: JobId::from("j1"),
            project_id: ProjectId::from("p1"),
            owner_id: "u1".to_string(),
            input_refs: vec!["a".into(), "b".into()],
            output_ref: "out".into(),
            options: JobOptions::Stitching(StitchingOptions::default()),
            retry_attempt: 0,
        }
    }

    #[tokio::test]
    async fn run_returns_execution_ref() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/executions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"execution_ref": "exec-42"})),
            )
            .mount(&server)
            .await;

        let client = ExecutionClient::new(ExecutionConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let execution_ref = client
            .run(&JobId::from("j1"), JobType::Stitching, &payload())
            .await
            .unwrap();
        assert_eq!(execution_ref.as_str(), "exec-42");
    }

    #[tokio::test]
    async fn status_maps_verdicts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/executions/exec-42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "succeeded"})),
            )
            .mount(&server)
            .await;

        let client = ExecutionClient::new(ExecutionConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let status = client
            .status(&ExecutionRef("exec-42".to_string()))
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert!(status.is_terminal());
    }

    #[tokio::test]
    async fn status_unknown_ref_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/executions/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ExecutionClient::new(ExecutionConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let result = client.status(&ExecutionRef("missing".to_string())).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
