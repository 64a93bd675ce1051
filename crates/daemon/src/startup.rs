//! Startup checks
//!
//! Before the worker starts, verify that the configured encoder and probe
//! commands can actually be executed.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `<command…> <version_flag>` and return its stdout.
pub fn check_tool_available(command: &[String], version_flag: &str) -> Result<String, StartupError> {
    let (program, leading) = command.split_first().ok_or_else(|| StartupError::ToolUnavailable {
        tool: "(empty command)".to_string(),
        reason: "no program configured".to_string(),
    })?;

    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: program.clone(),
        reason,
    };

    let output = Command::new(program)
        .args(leading)
        .arg(version_flag)
        .output()
        .map_err(|e| unavailable(format!("{} {} failed; is it installed and in PATH? Error: {}", program, version_flag, e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} {} exited with {}",
            program, version_flag, output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
///
/// Git builds ("ffmpeg version N-113802-g...") carry no release number.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains("ffmpeg version"))?;

    let version_part = version_line
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    version_str
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Check ffmpeg and ffprobe; returns the ffmpeg major version when it can be read.
pub fn run_startup_checks(cfg: &Config) -> Result<Option<u32>, StartupError> {
    let ffmpeg_output = check_tool_available(&cfg.encoder.ffmpeg_command, "-version")?;
    check_tool_available(&cfg.encoder.ffprobe_command, "-version")?;

    let major = parse_ffmpeg_version(&ffmpeg_output);
    match major {
        Some(major) => info!(major, "ffmpeg found"),
        None => warn!(
            first_line = ffmpeg_output.lines().next().unwrap_or("(empty)"),
            "could not parse ffmpeg version"
        ),
    }
    Ok(major)
}
