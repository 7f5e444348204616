//! Stitch pipeline: the fixed six-stage transform that turns a set of
//! local clips into one output video.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

use vforge_models::CompressionTier;

use crate::analyze::{analyze_inputs, validate_output, InputAnalysis, StreamProfile};
use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::manifest::write_manifest;
use crate::probe::MediaInfo;
use crate::progress::TranscodeProgress;

/// Domain minimum: a stitch needs at least this many usable inputs.
pub const MIN_STITCH_INPUTS: usize = 2;

/// Forward tool progress at most once per this much tool-reported elapsed
/// time, to avoid flooding the progress sink.
const PROGRESS_FORWARD_INTERVAL_MS: i64 = 2000;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchStage {
    ValidateInputs,
    Prepare,
    Analyze,
    BuildCommand,
    Execute,
    ValidateOutput,
}

impl StitchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            StitchStage::ValidateInputs => "validate_inputs",
            StitchStage::Prepare => "prepare",
            StitchStage::Analyze => "analyze",
            StitchStage::BuildCommand => "build_command",
            StitchStage::Execute => "execute",
            StitchStage::ValidateOutput => "validate_output",
        }
    }
}

/// Events emitted while the pipeline runs.
#[derive(Debug, Clone)]
pub enum StitchEvent {
    StageStarted(StitchStage),
    StageCompleted(StitchStage),
    /// Rate-bounded tool progress during the execute stage.
    ToolProgress {
        progress: TranscodeProgress,
        total_duration_secs: f64,
    },
}

/// One unit of stitch work over local files.
#[derive(Debug, Clone)]
pub struct StitchRequest {
    /// Ordered input clips
    pub inputs: Vec<PathBuf>,
    /// Final local output path
    pub output: PathBuf,
    /// Compression tier
    pub compression: CompressionTier,
    /// Keep audio in the output
    pub audio_enabled: bool,
    /// Explicit frame rate override
    pub target_fps: Option<f64>,
    /// Explicit resolution override
    pub target_resolution: Option<(u32, u32)>,
    /// Kill the tool after this many seconds
    pub tool_timeout_secs: u64,
}

/// Completion report from a successful stitch.
#[derive(Debug, Clone)]
pub struct StitchReport {
    /// Final output path
    pub output: PathBuf,
    /// Probed output info
    pub info: MediaInfo,
}

/// Executor for the stitch pipeline.
pub struct StitchPipeline;

impl StitchPipeline {
    /// Run all six stages. Partial artifacts are removed on every exit
    /// path: the stage workspace is a temp directory dropped on return, and
    /// the final path is only written by an atomic rename after the output
    /// validates.
    pub async fn run<F>(request: &StitchRequest, on_event: F) -> MediaResult<StitchReport>
    where
        F: Fn(StitchEvent) + Send + Sync + 'static,
    {
        let on_event = std::sync::Arc::new(on_event);

        // Stage 1: validate inputs.
        (*on_event)(StitchEvent::StageStarted(StitchStage::ValidateInputs));
        let present: Vec<PathBuf> = request
            .inputs
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect();
        if present.len() < MIN_STITCH_INPUTS {
            return Err(MediaError::TooFewInputs {
                needed: MIN_STITCH_INPUTS,
                available: present.len(),
            });
        }
        (*on_event)(StitchEvent::StageCompleted(StitchStage::ValidateInputs));

        // Stage workspace lives next to the output so the final rename
        // stays on one filesystem; dropped (and cleaned) on every return.
        let output_dir = request
            .output
            .parent()
            .ok_or_else(|| MediaError::invalid_video("output path has no parent directory"))?;
        tokio::fs::create_dir_all(output_dir).await?;
        let workspace = tempfile::TempDir::new_in(output_dir)?;

        // Stage 2: prepare the ordered manifest.
        (*on_event)(StitchEvent::StageStarted(StitchStage::Prepare));
        let manifest_path = write_manifest(&present, workspace.path()).await?;
        (*on_event)(StitchEvent::StageCompleted(StitchStage::Prepare));

        // Stage 3: analyze inputs, pick the common profile.
        (*on_event)(StitchEvent::StageStarted(StitchStage::Analyze));
        let analysis = analyze_inputs(&present, MIN_STITCH_INPUTS).await?;
        let profile = resolve_profile(request, &analysis);
        (*on_event)(StitchEvent::StageCompleted(StitchStage::Analyze));

        // Stage 4: build the tool invocation.
        (*on_event)(StitchEvent::StageStarted(StitchStage::BuildCommand));
        let staged_output = workspace.path().join("stitched.mp4");
        let command = build_stitch_command(
            &manifest_path,
            &staged_output,
            profile,
            request.compression,
            request.audio_enabled && analysis.all_have_audio,
        );
        (*on_event)(StitchEvent::StageCompleted(StitchStage::BuildCommand));

        // Stage 5: execute with streamed, rate-bounded progress.
        (*on_event)(StitchEvent::StageStarted(StitchStage::Execute));
        let total_duration = analysis.total_duration;
        // Seeded one interval back so the tool's first flush is forwarded.
        let last_forwarded_ms = Mutex::new(-PROGRESS_FORWARD_INTERVAL_MS);
        let runner = FfmpegRunner::new().with_timeout(request.tool_timeout_secs);

        let progress_events = std::sync::Arc::clone(&on_event);
        runner
            .run_with_progress(&command, move |progress| {
                let mut last = last_forwarded_ms
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let elapsed_since_forward = progress.out_time_ms - *last;
                if progress.is_complete || elapsed_since_forward >= PROGRESS_FORWARD_INTERVAL_MS {
                    *last = progress.out_time_ms;
                    drop(last);
                    (*progress_events)(StitchEvent::ToolProgress {
                        progress,
                        total_duration_secs: total_duration,
                    });
                }
            })
            .await?;
        (*on_event)(StitchEvent::StageCompleted(StitchStage::Execute));

        // Stage 6: validate the produced artifact.
        (*on_event)(StitchEvent::StageStarted(StitchStage::ValidateOutput));
        let report_info = validate_output(&staged_output).await?;

        // Atomic publish into the final path.
        tokio::fs::rename(&staged_output, &request.output).await?;
        (*on_event)(StitchEvent::StageCompleted(StitchStage::ValidateOutput));

        info!(
            "Stitched {} inputs into {} ({}x{}, {:.1}s, {} bytes)",
            present.len(),
            request.output.display(),
            report_info.width,
            report_info.height,
            report_info.duration,
            report_info.size
        );

        Ok(StitchReport {
            output: request.output.clone(),
            info: report_info,
        })
    }
}

/// Explicit option targets win over majority analysis.
fn resolve_profile(request: &StitchRequest, analysis: &InputAnalysis) -> StreamProfile {
    let mut profile = analysis.profile;
    if let Some((width, height)) = request.target_resolution {
        profile.width = width;
        profile.height = height;
    }
    if let Some(fps) = request.target_fps {
        profile.fps = fps;
    }
    profile
}

/// Build the concat + re-encode invocation.
fn build_stitch_command(
    manifest: &std::path::Path,
    output: &std::path::Path,
    profile: StreamProfile,
    compression: CompressionTier,
    audio: bool,
) -> FfmpegCommand {
    // Scale to fit the target and pad to exact size; inputs of mixed
    // resolution would otherwise break the concat filter chain.
    let filter = format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
        w = profile.width,
        h = profile.height
    );

    let mut command = FfmpegCommand::new(manifest, output)
        .concat_demuxer()
        .video_filter(filter)
        .fps(profile.fps)
        .video_codec("libx264")
        .crf(compression.crf())
        .preset(compression.preset())
        .output_args(["-pix_fmt", "yuv420p", "-movflags", "+faststart"]);

    if audio {
        command = command.audio_codec("aac");
    } else {
        // Disabled, or not every input carries audio: drop the track rather
        // than emit a broken one.
        warn!("Stitching without audio track");
        command = command.no_audio();
    }

    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::AnalyzedInput;

    fn analysis(width: u32, height: u32, fps: f64) -> InputAnalysis {
        InputAnalysis {
            inputs: vec![AnalyzedInput {
                path: PathBuf::from("a.mp4"),
                info: MediaInfo {
                    duration: 10.0,
                    width,
                    height,
                    fps,
                    codec: "h264".into(),
                    size: 1,
                    has_audio: true,
                },
            }],
            profile: StreamProfile { width, height, fps },
            total_duration: 10.0,
            all_have_audio: true,
        }
    }

    fn request() -> StitchRequest {
        StitchRequest {
            inputs: vec![],
            output: PathBuf::from("/tmp/out.mp4"),
            compression: CompressionTier::Balanced,
            audio_enabled: true,
            target_fps: None,
            target_resolution: None,
            tool_timeout_secs: 600,
        }
    }

    #[test]
    fn explicit_targets_override_analysis() {
        let mut req = request();
        req.target_resolution = Some((1280, 720));
        req.target_fps = Some(24.0);

        let profile = resolve_profile(&req, &analysis(1920, 1080, 30.0));
        assert_eq!((profile.width, profile.height), (1280, 720));
        assert!((profile.fps - 24.0).abs() < 0.01);
    }

    #[test]
    fn analysis_profile_used_by_default() {
        let profile = resolve_profile(&request(), &analysis(1920, 1080, 30.0));
        assert_eq!((profile.width, profile.height), (1920, 1080));
    }

    #[test]
    fn command_includes_scale_and_tier() {
        let command = build_stitch_command(
            std::path::Path::new("m.ffconcat"),
            std::path::Path::new("out.mp4"),
            StreamProfile {
                width: 1920,
                height: 1080,
                fps: 30.0,
            },
            CompressionTier::Quality,
            true,
        );

        let args = command.build_args();
        let joined = args.join(" ");
        assert!(joined.contains("scale=1920:1080"));
        assert!(joined.contains("-crf 18"));
        assert!(joined.contains("-preset slow"));
        assert!(joined.contains("-c:a aac"));
        assert!(!joined.contains("-an"));
    }

    #[test]
    fn audio_dropped_when_disabled() {
        let command = build_stitch_command(
            std::path::Path::new("m.ffconcat"),
            std::path::Path::new("out.mp4"),
            StreamProfile {
                width: 640,
                height: 480,
                fps: 30.0,
            },
            CompressionTier::Compact,
            false,
        );
        assert!(command.build_args().contains(&"-an".to_string()));
    }

    #[tokio::test]
    async fn too_few_inputs_rejected_before_any_work() {
        let mut req = request();
        req.inputs = vec![PathBuf::from("/nonexistent/only-one.mp4")];

        let result = StitchPipeline::run(&req, |_| {}).await;
        assert!(matches!(
            result,
            Err(MediaError::TooFewInputs { needed: 2, .. })
        ));
    }
}
