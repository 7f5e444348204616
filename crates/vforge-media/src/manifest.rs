//! Concat manifest rendering.
//!
//! The prepare stage writes an ffconcat manifest listing the inputs in
//! stitch order; the execute stage feeds it to the concat demuxer.

use std::path::{Path, PathBuf};

use crate::error::MediaResult;

/// Render the manifest body for the given inputs, in order.
pub fn render_manifest(inputs: &[PathBuf]) -> String {
    let mut body = String::from("ffconcat version 1.0\n");
    for path in inputs {
        body.push_str(&format!("file '{}'\n", escape_path(path)));
    }
    body
}

/// Write the manifest next to the stage workspace and return its path.
pub async fn write_manifest(inputs: &[PathBuf], dir: &Path) -> MediaResult<PathBuf> {
    let manifest_path = dir.join("inputs.ffconcat");
    tokio::fs::write(&manifest_path, render_manifest(inputs)).await?;
    Ok(manifest_path)
}

/// Escape a path for a single-quoted ffconcat entry. The concat demuxer
/// terminates a quoted string at `'`, so embedded quotes become `'\''`.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}
