//! Job payload wire contract.
//!
//! The payload is the flat, JSON-serializable structure handed to the
//! execution engine and parsed back by the runner before any side effect.
//! Unknown fields are ignored for forward compatibility; missing required
//! fields are a fatal parse error.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;
use crate::project::ProjectId;

/// Payload parse/validation failures. Fatal, no retry, no side effects.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Compression tier for stitched outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTier {
    /// Larger files, near-transparent quality
    Quality,
    #[default]
    Balanced,
    /// Smallest files, visible compression
    Compact,
}

impl CompressionTier {
    /// x264 CRF value for this tier.
    pub fn crf(&self) -> u8 {
        match self {
            CompressionTier::Quality => 18,
            CompressionTier::Balanced => 23,
            CompressionTier::Compact => 28,
        }
    }

    /// x264 preset for this tier.
    pub fn preset(&self) -> &'static str {
        match self {
            CompressionTier::Quality => "slow",
            CompressionTier::Balanced => "medium",
            CompressionTier::Compact => "veryfast",
        }
    }
}

/// Options for a stitching job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StitchingOptions {
    /// Compression tier
    #[serde(default)]
    pub compression: CompressionTier,

    /// Keep audio tracks in the output
    #[serde(default = "default_audio_enabled")]
    pub audio_enabled: bool,

    /// Explicit output frame rate; overrides majority analysis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fps: Option<f64>,

    /// Explicit output resolution (width, height); overrides majority analysis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resolution: Option<(u32, u32)>,
}

fn default_audio_enabled() -> bool {
    true
}

impl Default for StitchingOptions {
    fn default() -> Self {
        Self {
            compression: CompressionTier::default(),
            audio_enabled: true,
            target_fps: None,
            target_resolution: None,
        }
    }
}

/// Options for a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GenerationOptions {
    /// One clip is generated per prompt, in order
    pub prompts: Vec<String>,

    /// Duration of each generated clip in seconds
    #[serde(default = "default_clip_duration")]
    pub clip_duration_secs: f64,

    /// Output width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Output height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_clip_duration() -> f64 {
    6.0
}

fn default_width() -> u32 {
    1080
}

fn default_height() -> u32 {
    1920
}

/// Per-type options, discriminated by the record's job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobOptions {
    Stitching(StitchingOptions),
    Generation(GenerationOptions),
}

/// Flat payload handed to the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobPayload {
    /// Job this payload belongs to
    pub job_id: JobId,

    /// Owning project
    pub project_id: ProjectId,

    /// Owning user
    pub owner_id: String,

    /// Blob references to the inputs (stitching) or previously generated
    /// clips (generation resume)
    #[serde(default)]
    pub input_refs: Vec<String>,

    /// Blob reference the final artifact is written to
    pub output_ref: String,

    /// Per-type options
    pub options: JobOptions,

    /// Which attempt this is; > 0 means the runner should look for a
    /// checkpoint to resume from
    #[serde(default)]
    pub retry_attempt: u32,
}

impl JobPayload {
    /// Parse a payload from JSON and validate it.
    ///
    /// Missing required fields fail here, before any side effect occurs.
    pub fn from_json(raw: &str) -> Result<Self, PayloadError> {
        let payload: JobPayload = serde_json::from_str(raw)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Serialize to the wire shape.
    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate field contents beyond structural parsing.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.job_id.as_str().is_empty() {
            return Err(PayloadError::Invalid("job_id is empty".into()));
        }
        if self.project_id.as_str().is_empty() {
            return Err(PayloadError::Invalid("project_id is empty".into()));
        }
        if self.owner_id.is_empty() {
            return Err(PayloadError::Invalid("owner_id is empty".into()));
        }
        if self.output_ref.is_empty() {
            return Err(PayloadError::Invalid("output_ref is empty".into()));
        }

        match &self.options {
            JobOptions::Stitching(_) => {
                if self.input_refs.is_empty() {
                    return Err(PayloadError::Invalid(
                        "stitching payload has no input refs".into(),
                    ));
                }
            }
            JobOptions::Generation(opts) => {
                if opts.prompts.is_empty() {
                    return Err(PayloadError::Invalid(
                        "generation payload has no prompts".into(),
                    ));
                }
                if opts.clip_duration_secs <= 0.0 {
                    return Err(PayloadError::Invalid(format!(
                        "clip duration must be positive, got {}",
                        opts.clip_duration_secs
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stitch_json() -> String {
        r#"{
            "job_id": "j1",
            "project_id": "p1",
            "owner_id": "u1",
            "input_refs": ["clips/a.mp4", "clips/b.mp4"],
            "output_ref": "out/p1.mp4",
            "options": {"job_type": "stitching", "compression": "quality", "audio_enabled": false},
            "retry_attempt": 1
        }"#
        .to_string()
    }

    #[test]
    fn parse_stitching_payload() {
        let payload = JobPayload::from_json(&stitch_json()).unwrap();
        assert_eq!(payload.job_id.as_str(), "j1");
        assert_eq!(payload.input_refs.len(), 2);
        assert_eq!(payload.retry_attempt, 1);
        match payload.options {
            JobOptions::Stitching(ref opts) => {
                assert_eq!(opts.compression, CompressionTier::Quality);
                assert!(!opts.audio_enabled);
            }
            _ => panic!("expected stitching options"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = stitch_json().replace(
            "\"retry_attempt\": 1",
            "\"retry_attempt\": 1, \"some_future_field\": {\"x\": 1}",
        );
        let payload = JobPayload::from_json(&raw).unwrap();
        assert_eq!(payload.retry_attempt, 1);
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let raw = r#"{"job_id": "j1", "project_id": "p1", "owner_id": "u1"}"#;
        assert!(matches!(
            JobPayload::from_json(raw),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn empty_prompts_rejected() {
        let raw = r#"{
            "job_id": "j1",
            "project_id": "p1",
            "owner_id": "u1",
            "output_ref": "out/p1.mp4",
            "options": {"job_type": "generation", "prompts": []}
        }"#;
        assert!(matches!(
            JobPayload::from_json(raw),
            Err(PayloadError::Invalid(_))
        ));
    }

    #[test]
    fn roundtrip() {
        let payload = JobPayload::from_json(&stitch_json()).unwrap();
        let json = payload.to_json().unwrap();
        let decoded = JobPayload::from_json(&json).unwrap();
        assert_eq!(decoded.output_ref, payload.output_ref);
    }

    #[test]
    fn compression_tiers_map_to_encoder_settings() {
        assert!(CompressionTier::Quality.crf() < CompressionTier::Compact.crf());
        assert_eq!(CompressionTier::Balanced.preset(), "medium");
    }
}
