//! FFmpeg encoder module
//!
//! Builds the encoder command line for a task and runs it as a child process.
//! The only interactions with it are start, wait for exit, and SIGTERM.

use crate::config::EncoderConfig;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lines of encoder stderr kept for error reports
const STDERR_TAIL_LINES: usize = 5;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(io::Error),

    /// Encoder exited with non-zero status
    #[error("encoder exited with code {code}{}", format_stderr(.stderr))]
    Failed { code: i32, stderr: String },

    /// Encoder was terminated by a signal
    #[error("encoder was terminated by signal {}", format_signal(.signal))]
    Terminated { signal: Option<i32> },

    /// IO error while waiting for the encoder
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn format_signal(signal: &Option<i32>) -> String {
    match signal {
        Some(s) => s.to_string(),
        None => "unknown".to_string(),
    }
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Parameters for one encoder run
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Profile parameters, each emitted as `-<key> [value]`
    pub params: BTreeMap<String, String>,
    /// Where the encoder streams `key=value` progress lines
    pub progress_url: String,
}

impl EncodeParams {
    pub fn new(
        input_path: PathBuf,
        output_path: PathBuf,
        params: BTreeMap<String, String>,
        progress_url: String,
    ) -> Self {
        Self {
            input_path,
            output_path,
            params,
            progress_url,
        }
    }
}

/// Encoder arguments (everything after the program and its leading arguments)
///
/// Layout: global flags, progress target, overwrite, input, `-map 0` unless the
/// profile maps streams itself, profile parameters, output path.
pub fn build_ffmpeg_args(params: &EncodeParams) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |s: &str| args.push(OsString::from(s));

    push("-hide_banner");
    push("-nostats");
    push("-loglevel");
    push("error");
    push("-progress");
    push(params.progress_url.as_str());
    push("-y");
    push("-i");
    args.push(params.input_path.clone().into_os_string());

    let mut output_opts: BTreeMap<&str, &str> = BTreeMap::new();
    output_opts.insert("map", "0");
    for (key, value) in &params.params {
        output_opts.insert(key.as_str(), value.as_str());
    }

    for (key, value) in output_opts {
        args.push(OsString::from(format!("-{}", key)));
        if !value.is_empty() {
            args.push(OsString::from(value));
        }
    }

    args.push(params.output_path.clone().into_os_string());
    args
}

/// Build the full encoder command
///
/// Non-zero niceness wraps the encoder in `nice -n <niceness>`.
pub fn build_ffmpeg_command(cfg: &EncoderConfig, params: &EncodeParams) -> Command {
    let mut program = cfg.ffmpeg_command.iter();
    let encoder = program
        .next()
        .map(String::as_str)
        .unwrap_or("ffmpeg");

    let mut cmd = if cfg.niceness != 0 {
        let mut cmd = Command::new("nice");
        cmd.arg("-n").arg(cfg.niceness.to_string()).arg(encoder);
        cmd
    } else {
        Command::new(encoder)
    };

    cmd.args(program);
    cmd.args(build_ffmpeg_args(params));
    cmd
}

/// Handle used to stop a running encoder. Cloneable; does not own the process.
///
/// The signal itself is sent by [`EncoderProcess::wait`], which owns the child
/// and only signals it before reaping, so the pid is never stale.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    stop: Arc<Notify>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the process to stop gracefully (SIGTERM). A no-op once it has exited.
    pub fn terminate(&self) {
        self.stop.notify_one();
    }
}

/// A started encoder
pub struct EncoderProcess {
    child: Child,
    handle: ProcessHandle,
}

impl EncoderProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Wait for the encoder to exit and classify its exit status
    ///
    /// Stop requests from the handle are turned into SIGTERM while waiting.
    pub async fn wait(self) -> Result<(), EncodeError> {
        let EncoderProcess { mut child, handle } = self;
        let stderr_pipe = child.stderr.take();

        let collect_stderr = async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                if let Err(e) = pipe.read_to_end(&mut buf).await {
                    debug!(error = %e, "failed to read encoder stderr");
                }
            }
            buf
        };

        let exit = async {
            loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = handle.stop.notified() => send_sigterm(&child),
                }
            }
        };

        let (status, stderr) = tokio::join!(exit, collect_stderr);
        let status = status?;

        if status.success() {
            return Ok(());
        }

        match status.code() {
            Some(code) => Err(EncodeError::Failed {
                code,
                stderr: stderr_tail(&stderr),
            }),
            None => Err(EncodeError::Terminated {
                signal: status.signal(),
            }),
        }
    }
}

/// SIGTERM an unreaped child. `Child::id` is `None` once the child was reaped.
fn send_sigterm(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        warn!(pid, "pid out of range");
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety requirements.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        info!(pid, "sent SIGTERM to encoder");
    } else {
        warn!(pid, error = %io::Error::last_os_error(), "failed to signal encoder");
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("; ")
}

/// Start the encoder for `params`
///
/// stdout is discarded and stderr captured for error reports. The child is
/// killed if the returned process is dropped before it exits.
pub fn spawn_encoder(cfg: &EncoderConfig, params: &EncodeParams) -> Result<EncoderProcess, EncodeError> {
    let mut cmd = tokio::process::Command::from(build_ffmpeg_command(cfg, params));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(EncodeError::Spawn)?;
    let pid = child.id().ok_or_else(|| {
        EncodeError::Spawn(io::Error::new(
            io::ErrorKind::Other,
            "encoder exited before its pid was read",
        ))
    })?;

    Ok(EncoderProcess {
        child,
        handle: ProcessHandle {
            pid,
            stop: Arc::new(Notify::new()),
        },
    })
}
