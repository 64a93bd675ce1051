//! Per-task failure taxonomy.
//!
//! Each variant ends a task in `failed`; its `Display` text is stored on the
//! task's `error` field. None of them stop the worker.

use crate::encode::EncodeError;
use crate::probe::ProbeError;
use crate::replace::ReplaceError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Input metadata or duration could not be read.
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("profile '{0}' not found")]
    ProfileNotFound(String),

    /// The isolated temp directory, output path or progress socket could not be created.
    #[error("cannot allocate temporary output: {0}")]
    TempAllocation(io::Error),

    /// The encoder failed for a reason other than cancellation.
    #[error("encoding failed: {0}")]
    Process(#[from] EncodeError),

    #[error("file swap failed: {0}")]
    FileSwap(#[from] ReplaceError),

    /// Background work panicked or was aborted.
    #[error("interrupted: {0}")]
    Interrupted(String),
}
