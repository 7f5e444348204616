//! Transcode progress parsing.

use serde::{Deserialize, Serialize};

/// Progress information parsed from the external tool's status stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeProgress {
    /// Current frame number
    pub frame: u64,
    /// Current encode FPS
    pub fps: f64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g. 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl TranscodeProgress {
    /// Elapsed output time in seconds.
    pub fn out_time_secs(&self) -> f64 {
        self.out_time_ms as f64 / 1000.0
    }

    /// Fraction of `total_duration_ms` completed, clamped to [0, 100].
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if total_duration_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).min(100.0)
    }

    /// Estimated seconds remaining, when the tool reports a usable speed.
    pub fn eta_seconds(&self, total_duration_ms: i64) -> Option<f64> {
        if self.speed <= 0.0 || self.out_time_ms <= 0 {
            return None;
        }

        let remaining_ms = total_duration_ms - self.out_time_ms;
        if remaining_ms <= 0 {
            return Some(0.0);
        }

        Some((remaining_ms as f64 / 1000.0) / self.speed)
    }
}

/// Parse one line of FFmpeg's `-progress` key=value output, accumulating
/// into `current`. Returns a snapshot when the tool flushes a progress
/// block (the `progress=` line).
pub fn parse_progress_line(line: &str, current: &mut TranscodeProgress) -> Option<TranscodeProgress> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            "out_time_ms" | "out_time_us" => {
                // Both keys carry microseconds in modern ffmpeg builds.
                if let Ok(us) = value.parse::<i64>() {
                    current.out_time_ms = us / 1000;
                }
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    current.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    current.fps = fps;
                }
            }
            "speed" => {
                // Format: "1.5x" or "N/A"
                if value != "N/A" {
                    if let Some(speed_str) = value.strip_suffix('x') {
                        if let Ok(speed) = speed_str.trim().parse() {
                            current.speed = speed;
                        }
                    }
                }
            }
            "progress" => {
                // "continue" or "end"
                if value == "end" {
                    current.is_complete = true;
                }
                return Some(current.clone());
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_and_eta() {
        let progress = TranscodeProgress {
            out_time_ms: 5000,
            speed: 2.0,
            ..Default::default()
        };

        assert!((progress.percentage(10000) - 50.0).abs() < 0.01);
        assert!((progress.percentage(5000) - 100.0).abs() < 0.01);
        // 5 seconds remaining at 2x speed.
        assert!((progress.eta_seconds(10000).unwrap() - 2.5).abs() < 0.01);
        assert!(progress.eta_seconds(4000).unwrap().abs() < 0.01);
    }

    #[test]
    fn eta_unknown_without_speed() {
        let progress = TranscodeProgress {
            out_time_ms: 5000,
            ..Default::default()
        };
        assert!(progress.eta_seconds(10000).is_none());
    }

    #[test]
    fn line_parsing_accumulates_until_flush() {
        let mut progress = TranscodeProgress::default();

        assert!(parse_progress_line("out_time_us=5000000", &mut progress).is_none());
        assert_eq!(progress.out_time_ms, 5000);

        assert!(parse_progress_line("speed=1.5x", &mut progress).is_none());
        assert!((progress.speed - 1.5).abs() < 0.01);

        assert!(parse_progress_line("fps=48.2", &mut progress).is_none());
        assert!(parse_progress_line("speed=N/A", &mut progress).is_none());

        let snapshot = parse_progress_line("progress=continue", &mut progress).unwrap();
        assert!(!snapshot.is_complete);

        let snapshot = parse_progress_line("progress=end", &mut progress).unwrap();
        assert!(snapshot.is_complete);
    }
}
