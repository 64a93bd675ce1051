//! Automatic resolution policies.
//!
//! A [`ResolutionPolicy`] looks at a task waiting for resolution and may decide
//! its outcome. The worker consults it each time a task starts waiting, and a
//! periodic scanner re-applies it to every waiting task.

use crate::config::AutoRejectConfig;
use crate::registry::TaskRegistry;
use crate::resolver::Resolver;
use crate::size_gate::{check_size_gate, SizeGateResult};
use crate::task::{Task, TaskId, TaskStatus};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Decisions may touch the filesystem; [`PolicyRunner`] calls them on the
/// blocking pool.
pub trait ResolutionPolicy: Send + Sync {
    /// `Some(replace)` to resolve the task, `None` to leave it for a human.
    fn decide(&self, task: &Task) -> Option<bool>;
}

/// Keeps the original whenever the transcoded output came out larger.
#[derive(Debug)]
pub struct AutoReject {
    enabled: AtomicBool,
    max_size_ratio: f64,
}

impl AutoReject {
    pub fn new(config: &AutoRejectConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            max_size_ratio: config.max_size_ratio,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns true if this call switched the policy on.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        enabled && !previous
    }
}

impl ResolutionPolicy for AutoReject {
    fn decide(&self, task: &Task) -> Option<bool> {
        if !self.is_enabled() || task.status() != TaskStatus::WaitingForResolution {
            return None;
        }

        let output = task.temp_output()?;
        let output_bytes = fs::metadata(output).ok()?.len();
        let original_bytes = fs::metadata(&task.input).ok()?.len();

        match check_size_gate(original_bytes, output_bytes, self.max_size_ratio) {
            SizeGateResult::Reject { ratio, .. } => {
                info!(
                    task_id = %task.id,
                    original_bytes,
                    output_bytes,
                    ratio,
                    "auto-rejecting larger output"
                );
                Some(false)
            }
            SizeGateResult::Accept => None,
        }
    }
}

/// Applies a policy to waiting tasks through the resolver.
#[derive(Clone)]
pub struct PolicyRunner {
    policy: Arc<dyn ResolutionPolicy>,
    registry: Arc<TaskRegistry>,
    resolver: Resolver,
}

impl PolicyRunner {
    pub fn new(policy: Arc<dyn ResolutionPolicy>, registry: Arc<TaskRegistry>, resolver: Resolver) -> Self {
        Self {
            policy,
            registry,
            resolver,
        }
    }

    /// Consult the policy for one task; returns the decision that was started.
    pub async fn apply(&self, id: TaskId) -> Option<bool> {
        let task = self.registry.get(id).await?;
        let policy = Arc::clone(&self.policy);
        let replace = match tokio::task::spawn_blocking(move || policy.decide(&task)).await {
            Ok(decision) => decision?,
            Err(e) => {
                warn!(task_id = %id, error = %e, "policy decision panicked");
                return None;
            }
        };

        match self.resolver.resolve(id, replace).await {
            Ok(_) => Some(replace),
            Err(e) => {
                debug!(task_id = %id, error = %e, "policy decision not applied");
                None
            }
        }
    }

    /// Apply the policy to every waiting task; returns how many were resolved.
    pub async fn sweep(&self) -> usize {
        let waiting: Vec<TaskId> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|task| task.status() == TaskStatus::WaitingForResolution)
            .map(|task| task.id)
            .collect();

        let mut resolved = 0;
        for id in waiting {
            if self.apply(id).await.is_some() {
                resolved += 1;
            }
        }
        if resolved > 0 {
            info!(resolved, "policy sweep resolved tasks");
        }
        resolved
    }
}

/// Sweep waiting tasks every `interval`.
pub fn spawn_policy_scanner(runner: PolicyRunner, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            runner.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn policy(enabled: bool) -> AutoReject {
        AutoReject::new(&AutoRejectConfig {
            enabled,
            ..AutoRejectConfig::default()
        })
    }

    fn waiting(dir: &Path, original: &[u8], output: &[u8]) -> Task {
        let input = dir.join("movie.mp4");
        let temp_output = dir.join("out.mp4");
        fs::write(&input, original).unwrap();
        fs::write(&temp_output, output).unwrap();

        let mut task = Task::new(TaskId(1), input, "H264-fast".to_string());
        task.mark_processing().unwrap();
        task.set_temp_output(temp_output).unwrap();
        task.mark_waiting_for_resolution().unwrap();
        task
    }

    #[test]
    fn test_rejects_larger_output() {
        let dir = TempDir::new().unwrap();
        let task = waiting(dir.path(), b"small", b"much larger output");
        assert_eq!(policy(true).decide(&task), Some(false));
    }

    #[test]
    fn test_smaller_or_equal_output_left_for_user() {
        let dir = TempDir::new().unwrap();
        let task = waiting(dir.path(), b"original", b"smaller");
        assert_eq!(policy(true).decide(&task), None);

        let task = waiting(dir.path(), b"12345", b"abcde");
        assert_eq!(policy(true).decide(&task), None);
    }

    #[test]
    fn test_disabled_policy_decides_nothing() {
        let dir = TempDir::new().unwrap();
        let task = waiting(dir.path(), b"small", b"much larger output");
        assert_eq!(policy(false).decide(&task), None);
    }

    #[test]
    fn test_ignores_tasks_not_waiting() {
        let mut task = Task::new(TaskId(1), PathBuf::from("/media/movie.mp4"), "p".to_string());
        assert_eq!(policy(true).decide(&task), None);
        task.mark_processing().unwrap();
        assert_eq!(policy(true).decide(&task), None);
    }

    #[test]
    fn test_set_enabled_reports_switch_on() {
        let auto = policy(false);
        assert!(auto.set_enabled(true));
        assert!(!auto.set_enabled(true));
        assert!(auto.is_enabled());
        assert!(!auto.set_enabled(false));
        assert!(!auto.is_enabled());
    }

    struct ThreadRecorder(std::sync::Mutex<Option<std::thread::ThreadId>>);

    impl ResolutionPolicy for ThreadRecorder {
        fn decide(&self, _task: &Task) -> Option<bool> {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            None
        }
    }

    #[tokio::test]
    async fn test_decisions_run_off_the_runtime_thread() {
        let (registry, _queue) = TaskRegistry::new(4);
        let registry = Arc::new(registry);
        let id = registry
            .submit(PathBuf::from("/media/movie.mp4"), "p".to_string())
            .await
            .unwrap();

        let recorder = Arc::new(ThreadRecorder(std::sync::Mutex::new(None)));
        let runner = PolicyRunner::new(
            recorder.clone(),
            Arc::clone(&registry),
            Resolver::new(Arc::clone(&registry)),
        );

        assert_eq!(runner.apply(id).await, None);
        let decided_on = recorder.0.lock().unwrap().expect("policy was consulted");
        assert_ne!(decided_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_sweep_resolves_waiting_tasks() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("movie.mp4");
        let temp_dir = dir.path().join("task-1");
        let temp_output = temp_dir.join("movie.mp4");
        fs::write(&input, b"small").unwrap();
        fs::create_dir(&temp_dir).unwrap();
        fs::write(&temp_output, b"much larger output").unwrap();

        let (registry, _queue) = TaskRegistry::new(4);
        let registry = Arc::new(registry);
        let id = registry.submit(input.clone(), "p".to_string()).await.unwrap();
        let out = temp_output.clone();
        registry
            .transition(id, move |task| {
                task.mark_processing()?;
                task.set_temp_output(out).unwrap();
                task.mark_waiting_for_resolution()
            })
            .await
            .unwrap();

        let runner = PolicyRunner::new(
            Arc::new(policy(true)),
            Arc::clone(&registry),
            Resolver::new(Arc::clone(&registry)),
        );
        assert_eq!(runner.sweep().await, 1);
        assert_eq!(runner.sweep().await, 0);

        let status = registry.get(id).await.unwrap().status();
        assert!(matches!(status, TaskStatus::Replacing | TaskStatus::Completed));
        assert_eq!(fs::read(&input).unwrap(), b"small");
    }
}
