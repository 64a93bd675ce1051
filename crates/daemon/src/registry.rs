//! Task registry: the single owner of task state.
//!
//! Every mutation goes through [`TaskRegistry::update`] (or one of the helpers
//! built on it) while holding the write lock; readers only ever get clones.
//! Submission reserves a slot in the bounded work queue before the task is
//! created, so a rejected submission leaves no trace.

use crate::encode::ProcessHandle;
use crate::task::{Task, TaskId, TransitionError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Lookup or update failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Submission failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The work queue is at capacity; retry later.
    #[error("task queue is full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    /// The worker has shut down.
    #[error("task queue is closed")]
    Closed,

    /// Only raised by batch submission, which validates the profile up front.
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("cannot scan {path}: {reason}")]
    Scan { path: PathBuf, reason: String },
}

struct Entry {
    task: Task,
    process: Option<ProcessHandle>,
    /// Flips to true on the first cancel request.
    cancelled: watch::Sender<bool>,
}

struct Inner {
    next_id: u64,
    tasks: BTreeMap<TaskId, Entry>,
    queue: Option<mpsc::Sender<TaskId>>,
}

/// Receiving end of the work queue, consumed by the worker.
pub struct TaskQueue {
    rx: mpsc::Receiver<TaskId>,
}

impl TaskQueue {
    /// Next queued task id; `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<TaskId> {
        self.rx.recv().await
    }
}

/// Concurrency-safe store of all known tasks, keyed by id.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl TaskRegistry {
    /// Create a registry whose work queue holds at most `capacity` ids.
    pub fn new(capacity: usize) -> (Self, TaskQueue) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let registry = Self {
            inner: RwLock::new(Inner {
                next_id: 0,
                tasks: BTreeMap::new(),
                queue: Some(tx),
            }),
            capacity,
        };
        (registry, TaskQueue { rx })
    }

    /// Create a pending task and enqueue it. Ids are assigned under the write
    /// lock, so concurrent submissions get distinct, increasing ids.
    pub async fn submit(&self, input: PathBuf, profile: String) -> Result<TaskId, SubmitError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let sender = inner.queue.as_ref().ok_or(SubmitError::Closed)?;
        let permit = sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => SubmitError::QueueFull {
                capacity: self.capacity,
            },
            TrySendError::Closed(()) => SubmitError::Closed,
        })?;

        inner.next_id += 1;
        let id = TaskId(inner.next_id);
        let task = Task::new(id, input, profile);
        info!(task_id = %id, input = %task.input.display(), profile = %task.profile, "task added to queue");
        inner.tasks.insert(
            id,
            Entry {
                task,
                process: None,
                cancelled: watch::channel(false).0,
            },
        );
        permit.send(id);

        Ok(id)
    }

    /// Snapshot of one task, or `None` for an unknown id.
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .map(|entry| entry.task.clone())
    }

    /// Snapshots of all tasks, ordered by id.
    pub async fn list(&self) -> Vec<Task> {
        self.inner
            .read()
            .await
            .tasks
            .values()
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Apply `f` to the canonical task while holding the write lock.
    pub async fn update<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(f(&mut entry.task))
    }

    /// [`TaskRegistry::update`] for closures that perform a status transition.
    pub async fn transition<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut Task) -> Result<R, TransitionError>,
    ) -> Result<R, RegistryError> {
        Ok(self.update(id, f).await??)
    }

    /// Request cancellation; signals the live encoder process if there is one.
    ///
    /// Returns false when the task was already terminal.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if !entry.task.request_cancel() {
            debug!(task_id = %id, status = %entry.task.status(), "cancel ignored for finished task");
            return Ok(false);
        }

        info!(task_id = %id, status = %entry.task.status(), "cancellation requested");
        entry.cancelled.send_replace(true);
        if let Some(process) = &entry.process {
            signal_terminate(id, process);
        }
        Ok(true)
    }

    /// Receiver that turns true once cancellation of `id` is requested.
    pub async fn cancel_signal(&self, id: TaskId) -> Result<watch::Receiver<bool>, RegistryError> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .map(|entry| entry.cancelled.subscribe())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Remember the live encoder process for `id`. If cancellation was
    /// requested before the process existed, it is signalled right away.
    pub async fn attach_process(
        &self,
        id: TaskId,
        process: ProcessHandle,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if entry.task.cancel_requested() {
            signal_terminate(id, &process);
        }
        entry.process = Some(process);
        Ok(())
    }

    /// Forget the encoder process once it has exited.
    pub async fn detach_process(&self, id: TaskId) {
        if let Some(entry) = self.inner.write().await.tasks.get_mut(&id) {
            entry.process = None;
        }
    }

    /// Whether an active (pending or processing, not cancelled) task exists
    /// for this input and profile.
    pub async fn has_active_task(&self, input: &Path, profile: &str) -> bool {
        self.inner.read().await.tasks.values().any(|entry| {
            entry.task.input == input && entry.task.profile == profile && entry.task.is_active()
        })
    }

    /// Stop accepting submissions. Already queued ids are still delivered.
    pub async fn close(&self) {
        self.inner.write().await.queue = None;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn signal_terminate(id: TaskId, process: &ProcessHandle) {
    info!(task_id = %id, pid = process.pid(), "stopping encoder");
    process.terminate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn submit(registry: &TaskRegistry, name: &str) -> TaskId {
        registry
            .submit(PathBuf::from(name), "H264-fast".to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_creates_pending_task_and_enqueues() {
        let (registry, mut queue) = TaskRegistry::new(4);

        let id = submit(&registry, "/media/movie.mp4").await;
        assert_eq!(id, TaskId(1));

        let task = registry.get(id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.profile, "H264-fast");
        assert_eq!(queue.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_none() {
        let (registry, _queue) = TaskRegistry::new(4);
        assert!(registry.get(TaskId(0)).await.is_none());
        assert!(registry.get(TaskId(42)).await.is_none());
        assert_eq!(
            registry.update(TaskId(42), |_| ()).await,
            Err(RegistryError::NotFound(TaskId(42)))
        );
        assert_eq!(
            registry.cancel(TaskId(42)).await,
            Err(RegistryError::NotFound(TaskId(42)))
        );
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let (registry, _queue) = TaskRegistry::new(16);
        for i in 0..10 {
            submit(&registry, &format!("/media/{}.mkv", i)).await;
        }
        let ids: Vec<u64> = registry.list().await.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_creating_task() {
        let (registry, mut queue) = TaskRegistry::new(2);
        submit(&registry, "/a.mkv").await;
        submit(&registry, "/b.mkv").await;

        let err = registry
            .submit(PathBuf::from("/c.mkv"), "H264-fast".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::QueueFull { capacity: 2 });
        assert_eq!(registry.list().await.len(), 2);

        // Draining frees a slot; the next id has no gap.
        assert_eq!(queue.recv().await, Some(TaskId(1)));
        assert_eq!(submit(&registry, "/c.mkv").await, TaskId(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_get_distinct_ids() {
        let (registry, _queue) = TaskRegistry::new(256);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .submit(PathBuf::from(format!("/media/{}.mkv", i)), "p".to_string())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().0);
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(ids, (1..=100).collect::<HashSet<_>>());
    }

    #[tokio::test]
    async fn test_transition_errors_leave_task_unchanged() {
        let (registry, _queue) = TaskRegistry::new(4);
        let id = submit(&registry, "/a.mkv").await;

        let err = registry
            .transition(id, |t| t.mark_replacing())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Transition(_)));
        assert_eq!(registry.get(id).await.unwrap().status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_sets_request_and_ignores_terminal() {
        let (registry, _queue) = TaskRegistry::new(4);
        let id = submit(&registry, "/a.mkv").await;

        assert_eq!(registry.cancel(id).await, Ok(true));
        assert!(registry.get(id).await.unwrap().cancel_requested());
        assert!(!registry.has_active_task(Path::new("/a.mkv"), "H264-fast").await);

        let other = submit(&registry, "/b.mkv").await;
        registry
            .transition(other, |t| {
                t.mark_processing()?;
                t.mark_failed("boom")
            })
            .await
            .unwrap();
        assert_eq!(registry.cancel(other).await, Ok(false));
    }

    #[tokio::test]
    async fn test_cancel_signal_fires_on_request() {
        let (registry, _queue) = TaskRegistry::new(4);
        let id = submit(&registry, "/a.mkv").await;
        let mut signal = registry.cancel_signal(id).await.unwrap();
        assert!(!*signal.borrow());

        registry.cancel(id).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();

        // a receiver taken after the request sees it right away
        assert!(*registry.cancel_signal(id).await.unwrap().borrow());
        assert_eq!(
            registry.cancel_signal(TaskId(9)).await.err(),
            Some(RegistryError::NotFound(TaskId(9)))
        );
    }

    #[tokio::test]
    async fn test_has_active_task_matches_input_and_profile() {
        let (registry, _queue) = TaskRegistry::new(4);
        submit(&registry, "/media/a.mkv").await;

        assert!(registry.has_active_task(Path::new("/media/a.mkv"), "H264-fast").await);
        assert!(!registry.has_active_task(Path::new("/media/a.mkv"), "H264 Slow").await);
        assert!(!registry.has_active_task(Path::new("/media/b.mkv"), "H264-fast").await);
    }

    #[tokio::test]
    async fn test_close_rejects_new_submissions_but_drains_queue() {
        let (registry, mut queue) = TaskRegistry::new(4);
        let id = submit(&registry, "/a.mkv").await;
        registry.close().await;

        assert_eq!(
            registry
                .submit(PathBuf::from("/b.mkv"), "p".to_string())
                .await,
            Err(SubmitError::Closed)
        );
        assert_eq!(queue.recv().await, Some(id));
        assert_eq!(queue.recv().await, None);
    }
}
