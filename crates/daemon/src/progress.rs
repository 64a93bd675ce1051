//! Progress channel between the daemon and a running encoder.
//!
//! The encoder is started with `-progress unix://<socket>` and writes blocks of
//! `key=value` lines into the socket. Elapsed output time is reported in
//! microseconds by `out_time_us` (and, despite its name, `out_time_ms`); the
//! last occurrence wins. A `progress=end` line marks completion.

use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Elapsed time values are microseconds.
const TIME_SCALE: f64 = 1_000_000.0;

const END_SENTINEL: &str = "progress=end";

/// Longest unterminated line kept; anything longer is dropped up to its newline.
const MAX_LINE_BYTES: usize = 4096;

fn elapsed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^out_time_(?:us|ms)=(\d+)$").ok())
        .as_ref()
}

/// Incremental parser for the encoder progress protocol.
///
/// Bytes may arrive split at arbitrary points; only complete lines are parsed.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_secs: f64,
    pending: Vec<u8>,
    /// Inside an overlong line that is being skipped
    discarding: bool,
    elapsed_us: u64,
    ended: bool,
}

impl ProgressParser {
    pub fn new(total_secs: f64) -> Self {
        Self {
            total_secs,
            pending: Vec::new(),
            discarding: false,
            elapsed_us: 0,
            ended: false,
        }
    }

    /// Feed received bytes; returns the new fraction if any complete line moved it.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<f64> {
        self.pending.extend_from_slice(bytes);

        let mut updated = false;
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            updated |= self.parse_line(line.trim());
        }

        if self.pending.len() > MAX_LINE_BYTES {
            debug!(bytes = self.pending.len(), "dropping overlong progress line");
            self.pending.clear();
            self.discarding = true;
        }

        updated.then(|| self.fraction())
    }

    fn parse_line(&mut self, line: &str) -> bool {
        if line == END_SENTINEL {
            self.ended = true;
            return true;
        }

        let elapsed = elapsed_pattern()
            .and_then(|re| re.captures(line))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());

        match elapsed {
            Some(us) => {
                self.elapsed_us = us;
                true
            }
            None => false,
        }
    }

    /// Current completion fraction in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.ended {
            return 1.0;
        }
        if !(self.total_secs > 0.0) {
            return 0.0;
        }
        (self.elapsed_us as f64 / (self.total_secs * TIME_SCALE)).clamp(0.0, 1.0)
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// A listening progress endpoint for one encoder run.
///
/// The socket file is removed and the listener stopped when this is dropped.
#[derive(Debug)]
pub struct ProgressChannel {
    path: PathBuf,
    listener: JoinHandle<()>,
    updates: watch::Receiver<f64>,
}

impl ProgressChannel {
    /// Bind a fresh socket in `dir` and start listening.
    pub fn open(dir: &Path, total_secs: f64) -> io::Result<Self> {
        let path = dir.join(format!("{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&path)?;
        let (tx, updates) = watch::channel(0.0);

        let listener = tokio::spawn(listen(listener, total_secs, tx));

        Ok(Self {
            path,
            listener,
            updates,
        })
    }

    /// Address to pass to the encoder's `-progress` option.
    pub fn url(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver of the latest reported fraction.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.updates.clone()
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        self.listener.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove progress socket");
            }
        }
    }
}

async fn listen(listener: UnixListener, total_secs: f64, tx: watch::Sender<f64>) {
    let mut parser = ProgressParser::new(total_secs);
    let mut buf = [0u8; 4096];

    loop {
        let mut stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "progress listener accept failed");
                return;
            }
        };

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(fraction) = parser.feed(&buf[..n]) {
                        tx.send_replace(fraction);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "progress stream read failed");
                    break;
                }
            }
        }

        if parser.is_ended() {
            return;
        }
    }
}
