//! Resolution of finished tasks: keep the original or replace it.
//!
//! `resolve` flips the task to `replacing` under the registry lock before
//! returning, so a second request for the same task is refused. The file work
//! runs on the blocking pool and applies the final transition when done.

use crate::error::TaskError;
use crate::registry::TaskRegistry;
use crate::replace::{atomic_replace, ReplaceError};
use crate::task::{Task, TaskId, TaskStatus};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Refused resolution request. The task is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is {status}, not waiting for resolution")]
    InvalidState { id: TaskId, status: TaskStatus },
}

#[derive(Clone)]
pub struct Resolver {
    registry: Arc<TaskRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Start resolving `id`. With `replace` the transcoded output overwrites
    /// the input; otherwise the output is discarded.
    ///
    /// The returned handle completes once the task reached `completed` or
    /// `failed`; callers are free to drop it.
    pub async fn resolve(&self, id: TaskId, replace: bool) -> Result<JoinHandle<()>, ResolveError> {
        let task = self
            .registry
            .update(id, |task| -> Result<Task, TaskStatus> {
                if task.status() != TaskStatus::WaitingForResolution {
                    return Err(task.status());
                }
                task.mark_replacing().map_err(|e| e.from)?;
                Ok(task.clone())
            })
            .await
            .map_err(|_| ResolveError::NotFound(id))?
            .map_err(|status| ResolveError::InvalidState { id, status })?;

        info!(task_id = %id, replace, "resolving task");

        let registry = Arc::clone(&self.registry);
        Ok(tokio::spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || apply_resolution(&task, replace)).await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskError::Interrupted(e.to_string())),
            };

            let result = registry
                .transition(id, |task| match &outcome {
                    Ok(()) => task.mark_completed(),
                    Err(e) => task.mark_failed(e),
                })
                .await;

            match (&outcome, result) {
                (Ok(()), Ok(())) => info!(task_id = %id, replace, "task completed"),
                (Err(e), Ok(())) => error!(task_id = %id, replace, error = %e, "resolution failed"),
                (_, Err(e)) => warn!(task_id = %id, error = %e, "cannot record resolution outcome"),
            }
        }))
    }
}

/// Blocking part of a resolution.
fn apply_resolution(task: &Task, replace: bool) -> Result<(), TaskError> {
    let temp_output = task.temp_output();
    let temp_dir = temp_output.and_then(Path::parent);

    if !replace {
        if let Some(dir) = temp_dir {
            remove_temp_dir(dir).map_err(ReplaceError::Cleanup)?;
        }
        return Ok(());
    }

    let temp_output = temp_output.ok_or_else(|| {
        ReplaceError::OpenSource(io::Error::new(
            io::ErrorKind::NotFound,
            "task has no transcoded output",
        ))
    })?;

    let written = atomic_replace(temp_output, &task.input)?;
    info!(task_id = %task.id, bytes = written, dst = %task.input.display(), "original replaced");

    if let Some(dir) = temp_dir {
        if let Err(e) = remove_temp_dir(dir) {
            warn!(task_id = %task.id, dir = %dir.display(), error = %e, "failed to remove temp directory");
        }
    }
    Ok(())
}

/// Remove a task's temp directory; an already missing directory is fine.
pub(crate) fn remove_temp_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
