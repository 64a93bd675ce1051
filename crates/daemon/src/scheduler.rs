//! Worker that drains the task queue.
//!
//! Tasks run one at a time by default, or up to `max_concurrent_tasks` at once.
//! Per task: probe the input, look up the profile, allocate an isolated temp
//! directory, open the progress channel, run the encoder and classify the
//! outcome. Cancellation is checked right after dequeue and again after the
//! encoder exits; the second check decides between `cancelled` and the
//! encoder's own result. A cancel request also abandons a probe in progress.

use crate::auto_reject::PolicyRunner;
use crate::config::{EncoderConfig, Profile};
use crate::encode::{spawn_encoder, EncodeParams};
use crate::error::TaskError;
use crate::probe::probe_media;
use crate::progress::ProgressChannel;
use crate::registry::{TaskQueue, TaskRegistry};
use crate::resolver::remove_temp_dir;
use crate::task::{Task, TaskId, TaskStatus};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a task run needs besides the registry.
pub(crate) struct RunContext {
    pub encoder: EncoderConfig,
    pub profiles: Vec<Profile>,
    /// Parent of the per-task temp directories
    pub temp_root: PathBuf,
    /// Where progress sockets are created
    pub socket_dir: PathBuf,
    pub policy: PolicyRunner,
}

impl RunContext {
    fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// The queue consumer. Obtained from [`crate::Processor::new`].
pub struct Worker {
    registry: Arc<TaskRegistry>,
    queue: TaskQueue,
    context: Arc<RunContext>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Worker {
    pub(crate) fn new(
        registry: Arc<TaskRegistry>,
        queue: TaskQueue,
        context: RunContext,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            queue,
            context: Arc::new(context),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Run until the queue is closed and drained, then wait for tasks in flight.
    pub async fn run(mut self) {
        info!(max_concurrent = self.max_concurrent, "worker started");

        while let Some(id) = self.queue.recv().await {
            let Some(permit) = self.acquire_permit().await else {
                break;
            };
            let registry = Arc::clone(&self.registry);
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                run_task(&context, &registry, id).await;
                drop(permit);
            });
        }

        let permits = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        if self.semaphore.acquire_many(permits).await.is_err() {
            warn!("worker semaphore closed while draining");
        }
        info!("worker stopped");
    }
}

async fn run_task(ctx: &RunContext, registry: &TaskRegistry, id: TaskId) {
    let started = registry
        .transition(id, |task| {
            task.mark_processing()?;
            if task.observe_cancel() {
                task.mark_cancelled()?;
                return Ok(None);
            }
            Ok(Some(task.clone()))
        })
        .await;

    let task = match started {
        Ok(Some(task)) => task,
        Ok(None) => {
            info!(task_id = %id, "task cancelled before start");
            return;
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "cannot start task");
            return;
        }
    };

    let cancel = match registry.cancel_signal(id).await {
        Ok(cancel) => cancel,
        Err(e) => {
            error!(task_id = %id, error = %e, "cannot start task");
            return;
        }
    };

    info!(task_id = %id, input = %task.input.display(), profile = %task.profile, "processing task");
    let outcome = execute(ctx, registry, &task, cancel).await;
    conclude(ctx, registry, id, outcome).await;
}

async fn execute(
    ctx: &RunContext,
    registry: &TaskRegistry,
    task: &Task,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), TaskError> {
    let id = task.id;

    // Dropping the probe future kills ffprobe.
    let probe = tokio::select! {
        probe = probe_media(&ctx.encoder, &task.input) => probe?,
        _ = cancel_requested(&mut cancel) => {
            info!(task_id = %id, "probe abandoned after cancel request");
            return Err(TaskError::Interrupted("cancelled while probing".to_string()));
        }
    };
    debug!(task_id = %id, duration_secs = probe.duration_secs, "probed input");

    let profile = ctx
        .profile(&task.profile)
        .ok_or_else(|| TaskError::ProfileNotFound(task.profile.clone()))?;

    let temp_output =
        allocate_temp_output(&ctx.temp_root, id, &task.input).map_err(TaskError::TempAllocation)?;
    let recorded = temp_output.clone();
    match registry.update(id, |t| t.set_temp_output(recorded)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = %id, error = %e, "cannot record temp output"),
        Err(e) => warn!(task_id = %id, error = %e, "cannot record temp output"),
    }

    let channel = ProgressChannel::open(&ctx.socket_dir, probe.duration_secs)
        .map_err(TaskError::TempAllocation)?;
    let params = EncodeParams::new(
        task.input.clone(),
        temp_output,
        profile.params.clone(),
        channel.url(),
    );

    let process = spawn_encoder(&ctx.encoder, &params)?;
    let handle = process.handle();
    info!(task_id = %id, pid = handle.pid(), "encoder started");
    if let Err(e) = registry.attach_process(id, handle).await {
        warn!(task_id = %id, error = %e, "cannot attach encoder process");
    }

    let mut progress = channel.subscribe();
    let wait = process.wait();
    tokio::pin!(wait);
    let mut listening = true;

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            changed = progress.changed(), if listening => match changed {
                Ok(()) => {
                    let fraction = *progress.borrow_and_update();
                    let _ = registry.update(id, |t| t.record_progress(fraction)).await;
                }
                Err(_) => listening = false,
            },
        }
    };

    registry.detach_process(id).await;

    let fraction = *progress.borrow();
    let _ = registry.update(id, |t| t.record_progress(fraction)).await;

    result.map_err(TaskError::from)
}

/// Final classification after the run; cancellation takes precedence.
async fn conclude(ctx: &RunContext, registry: &TaskRegistry, id: TaskId, outcome: Result<(), TaskError>) {
    let concluded = registry
        .transition(id, |task| {
            if task.observe_cancel() {
                task.mark_cancelled()?;
            } else {
                match &outcome {
                    Ok(()) => task.mark_waiting_for_resolution()?,
                    Err(e) => task.mark_failed(e)?,
                }
            }
            Ok((task.status(), task.temp_output().map(Path::to_path_buf)))
        })
        .await;

    let (status, temp_output) = match concluded {
        Ok(concluded) => concluded,
        Err(e) => {
            error!(task_id = %id, error = %e, "cannot record task outcome");
            return;
        }
    };

    match status {
        TaskStatus::WaitingForResolution => {
            info!(task_id = %id, "task waiting for resolution");
            if let Some(replace) = ctx.policy.apply(id).await {
                info!(task_id = %id, replace, "policy resolved task");
            }
        }
        TaskStatus::Cancelled => info!(task_id = %id, "task cancelled"),
        _ => {
            if let Err(e) = &outcome {
                error!(task_id = %id, error = %e, "task failed");
            }
        }
    }

    if status != TaskStatus::WaitingForResolution {
        if let Some(dir) = temp_output.as_deref().and_then(Path::parent) {
            if let Err(e) = remove_temp_dir(dir) {
                warn!(task_id = %id, dir = %dir.display(), error = %e, "failed to remove temp directory");
            }
        }
    }
}

/// Resolves once cancellation is requested; never if the registry entry goes away.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// `<root>/task-<id>-<uuid>/<input file name>`; the directory is created.
pub(crate) fn allocate_temp_output(root: &Path, id: TaskId, input: &Path) -> io::Result<PathBuf> {
    let name = input
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "input has no file name"))?;
    let dir = root.join(format!("task-{}-{}", id, Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join(name))
}
