//! FFmpeg CLI wrapper and the stitch stage pipeline.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - FFprobe media inspection
//! - Majority-profile input analysis
//! - The six-stage stitch pipeline with scoped cleanup

pub mod analyze;
pub mod command;
pub mod error;
pub mod manifest;
pub mod probe;
pub mod progress;
pub mod stitch;

pub use analyze::{analyze_inputs, validate_output, InputAnalysis, StreamProfile};
pub use command::{FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{check_ffmpeg, check_ffprobe, probe_media, MediaInfo};
pub use progress::TranscodeProgress;
pub use stitch::{
    StitchEvent, StitchPipeline, StitchReport, StitchRequest, StitchStage, MIN_STITCH_INPUTS,
};
