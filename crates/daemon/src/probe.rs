//! Media probing using ffprobe.
//!
//! The duration reported here is the denominator of the progress fraction,
//! so a probe failure aborts the task before the encoder is launched.

use crate::config::EncoderConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Container metadata carries no usable duration.
    #[error("no duration in probe output")]
    MissingDuration,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One stream of a probed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    /// "video", "audio", "subtitle", ...
    pub codec_type: String,
    pub codec_name: String,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaProbe {
    /// Container duration in seconds.
    pub duration_secs: f64,
    /// File size in bytes, when ffprobe reports it.
    pub size_bytes: Option<u64>,
    pub streams: Vec<StreamInfo>,
}

impl MediaProbe {
    /// True if any stream's codec name contains one of `codecs`.
    pub fn uses_any_codec(&self, codecs: &[String]) -> bool {
        self.streams.iter().any(|stream| {
            codecs
                .iter()
                .any(|codec| !codec.is_empty() && stream.codec_name.contains(codec.as_str()))
        })
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Probes a media file.
///
/// Runs `<ffprobe_command…> -v quiet -print_format json -show_format -show_streams <path>`.
pub async fn probe_media(cfg: &EncoderConfig, path: &Path) -> Result<MediaProbe, ProbeError> {
    let (program, leading) = cfg
        .ffprobe_command
        .split_first()
        .ok_or_else(|| ProbeError::FfprobeFailed("ffprobe command is empty".to_string()))?;

    let output = Command::new(program)
        .args(leading)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
}

/// Parses ffprobe JSON output into a MediaProbe.
pub fn parse_probe_output(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("missing format information in ffprobe output".to_string())
    })?;

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or(ProbeError::MissingDuration)?;

    let size_bytes = format.size.as_deref().and_then(|s| s.trim().parse().ok());

    let streams = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .map(|s| StreamInfo {
            codec_type: s.codec_type.unwrap_or_default(),
            codec_name: s.codec_name.unwrap_or_default(),
        })
        .collect();

    Ok(MediaProbe {
        duration_secs,
        size_bytes,
        streams,
    })
}
