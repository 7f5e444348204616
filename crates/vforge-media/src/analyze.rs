//! Input analysis for stitching.
//!
//! Picks the common output profile from the probed inputs: the majority
//! resolution and the majority frame rate. Majorities, not averages, so the
//! output always matches at least one real input instead of a resolution
//! nothing was shot at.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_media, MediaInfo};

/// Target encode profile for the stitched output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamProfile {
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Output frame rate
    pub fps: f64,
}

/// Probed input with its source path.
#[derive(Debug, Clone)]
pub struct AnalyzedInput {
    pub path: PathBuf,
    pub info: MediaInfo,
}

/// Result of the analyze stage.
#[derive(Debug, Clone)]
pub struct InputAnalysis {
    /// Inputs that probed as well-formed video, in input order
    pub inputs: Vec<AnalyzedInput>,
    /// Chosen common profile
    pub profile: StreamProfile,
    /// Total duration of all inputs in seconds
    pub total_duration: f64,
    /// True when every usable input carries audio
    pub all_have_audio: bool,
}

/// Probe every input and select the common target profile.
///
/// Inputs that fail to probe are skipped; the caller enforces the domain
/// minimum on the usable count.
pub async fn analyze_inputs(paths: &[PathBuf], min_inputs: usize) -> MediaResult<InputAnalysis> {
    let mut inputs = Vec::new();

    for path in paths {
        match probe_media(path).await {
            Ok(info) => inputs.push(AnalyzedInput {
                path: path.clone(),
                info,
            }),
            Err(e) => {
                tracing::warn!("Skipping unusable input {}: {}", path.display(), e);
            }
        }
    }

    if inputs.len() < min_inputs {
        return Err(MediaError::TooFewInputs {
            needed: min_inputs,
            available: inputs.len(),
        });
    }

    let profile = majority_profile(&inputs);
    let total_duration = inputs.iter().map(|i| i.info.duration).sum();
    let all_have_audio = inputs.iter().all(|i| i.info.has_audio);

    info!(
        "Analyzed {} inputs: target {}x{} @ {:.2} fps, {:.1}s total",
        inputs.len(),
        profile.width,
        profile.height,
        profile.fps,
        total_duration
    );

    Ok(InputAnalysis {
        inputs,
        profile,
        total_duration,
        all_have_audio,
    })
}

/// Majority resolution and frame rate across the inputs. Ties resolve to
/// the value seen earliest in input order, keeping the choice deterministic.
fn majority_profile(inputs: &[AnalyzedInput]) -> StreamProfile {
    let resolution = majority_by(inputs, |i| (i.info.width, i.info.height));
    // Bucket fps to hundredths so 29.97 from different containers agree.
    let fps_key = majority_by(inputs, |i| (i.info.fps * 100.0).round() as i64);

    StreamProfile {
        width: resolution.0,
        height: resolution.1,
        fps: fps_key as f64 / 100.0,
    }
}

fn majority_by<K, F>(inputs: &[AnalyzedInput], key: F) -> K
where
    K: std::hash::Hash + Eq + Copy,
    F: Fn(&AnalyzedInput) -> K,
{
    let mut counts: HashMap<K, usize> = HashMap::new();
    let mut first_seen: HashMap<K, usize> = HashMap::new();

    for (index, input) in inputs.iter().enumerate() {
        let k = key(input);
        *counts.entry(k).or_insert(0) += 1;
        first_seen.entry(k).or_insert(index);
    }

    counts
        .into_iter()
        .max_by(|(ka, ca), (kb, cb)| {
            // Higher count wins; earlier first appearance breaks ties.
            ca.cmp(cb)
                .then_with(|| first_seen[kb].cmp(&first_seen[ka]))
        })
        .map(|(k, _)| k)
        .expect("majority_by called with non-empty inputs")
}

/// Validate a produced output: it must exist and probe as well-formed
/// video. Returns the probed info for the completion report.
pub async fn validate_output(path: &Path) -> MediaResult<MediaInfo> {
    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let info = probe_media(path).await?;
    if info.duration <= 0.0 {
        return Err(MediaError::invalid_video(format!(
            "Output {} has zero duration",
            path.display()
        )));
    }

    Ok(info)
}
