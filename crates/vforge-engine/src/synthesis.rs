//! Clip synthesis service client.
//!
//! Generation jobs call out to an external model service that turns a
//! prompt into a short video clip. Only the interface boundary lives here:
//! the request shape, the download of the produced clip, and retry on
//! transport failures.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// A prompt-to-clip synthesizer as the generation pipeline sees it.
#[async_trait]
pub trait ClipSynthesizer: Send + Sync {
    /// Generate a clip for a prompt, writing it to `dest`.
    async fn synthesize(&self, request: &SynthesisRequest, dest: &Path) -> EngineResult<()>;
}

/// Parameters for one synthesized clip.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    /// Text prompt
    pub prompt: String,
    /// Clip duration in seconds
    pub duration_secs: f64,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
}

/// Configuration for the HTTP synthesis client.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Base URL of the synthesis service
    pub base_url: String,
    /// Request timeout; generation takes minutes
    pub timeout: Duration,
    /// Max transport retries
    pub max_retries: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8200".to_string(),
            timeout: Duration::from_secs(600),
            max_retries: 1,
        }
    }
}

impl SynthesisConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SYNTHESIS_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8200".to_string()),
            timeout: Duration::from_secs(
                std::env::var("SYNTHESIS_SERVICE_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            max_retries: std::env::var("SYNTHESIS_SERVICE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        }
    }
}

/// HTTP client for the synthesis service.
pub struct SynthesisClient {
    http: reqwest::Client,
    config: SynthesisConfig,
}

impl SynthesisClient {
    /// Create a new client.
    pub fn new(config: SynthesisConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EngineError::Network)?;
        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::new(SynthesisConfig::from_env())
    }

    async fn synthesize_once(&self, request: &SynthesisRequest, dest: &Path) -> EngineResult<()> {
        let url = format!("{}/v1/synthesize", self.config.base_url);
        debug!("Requesting clip synthesis from {}", url);

        let response = self.http.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::request_failed(format!(
                "synthesis service returned {}: {}",
                status, body
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stream the clip body to disk instead of buffering it in memory.
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;

        if written == 0 {
            return Err(EngineError::invalid_response(
                "synthesis service returned an empty clip",
            ));
        }

        info!("Synthesized clip ({} bytes) to {}", written, dest.display());
        Ok(())
    }
}

#[async_trait]
impl ClipSynthesizer for SynthesisClient {
    async fn synthesize(&self, request: &SynthesisRequest, dest: &Path) -> EngineResult<()> {
        let mut attempt = 0;
        loop {
            match self.synthesize_once(request, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!("Clip synthesis failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SynthesisRequest {
        SynthesisRequest {
            prompt: "a red fox at dawn".to_string(),
            duration_secs: 6.0,
            width: 1080,
            height: 1920,
        }
    }

    #[tokio::test]
    async fn synthesize_writes_clip_to_disk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/synthesize"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fake-mp4-bytes".to_vec()))
            .mount(&server)
            .await;

        let client = SynthesisClient::new(SynthesisConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("clips").join("clip_00.mp4");

        client.synthesize(&request(), &dest).await.unwrap();
        let bytes = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(bytes, b"fake-mp4-bytes");
    }

    #[tokio::test]
    async fn empty_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/synthesize"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = SynthesisClient::new(SynthesisConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let result = client.synthesize(&request(), &dest).await;
        assert!(matches!(result, Err(EngineError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn server_error_is_not_retried_forever() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/synthesize"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let client = SynthesisClient::new(SynthesisConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let result = client
            .synthesize(&request(), &dir.path().join("clip.mp4"))
            .await;
        assert!(matches!(result, Err(EngineError::RequestFailed(_))));
    }
}
