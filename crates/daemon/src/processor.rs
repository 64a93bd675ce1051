//! Processor: the handle through which everything outside the worker talks to
//! the task engine.

use crate::auto_reject::{spawn_policy_scanner, AutoReject, PolicyRunner, ResolutionPolicy};
use crate::config::{Config, Profile};
use crate::probe::probe_media;
use crate::registry::{RegistryError, SubmitError, TaskRegistry};
use crate::resolver::{ResolveError, Resolver};
use crate::scan::scan_directory;
use crate::scheduler::{RunContext, Worker};
use crate::task::{Task, TaskId, TaskStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Outcome of a directory submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub submitted: Vec<TaskId>,
    /// Files that already have an active task for the profile.
    pub skipped_existing: Vec<PathBuf>,
    /// Files using one of the profile's excluded codecs.
    pub skipped_excluded: Vec<PathBuf>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub path: PathBuf,
    pub reason: String,
}

struct Shared {
    config: Config,
    registry: Arc<TaskRegistry>,
    resolver: Resolver,
    auto_reject: Arc<AutoReject>,
    policy: PolicyRunner,
}

/// Cloneable handle to the task engine.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<Shared>,
}

impl Processor {
    /// Build the engine. The returned [`Worker`] must be run for tasks to make progress.
    pub fn new(config: Config) -> (Self, Worker) {
        let (registry, queue) = TaskRegistry::new(config.queue.capacity);
        let registry = Arc::new(registry);
        let resolver = Resolver::new(Arc::clone(&registry));
        let auto_reject = Arc::new(AutoReject::new(&config.auto_reject));
        let policy: Arc<dyn ResolutionPolicy> = auto_reject.clone();
        let policy = PolicyRunner::new(policy, Arc::clone(&registry), resolver.clone());

        let temp_root = config
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("easy-transcoder"));

        let context = RunContext {
            encoder: config.encoder.clone(),
            profiles: config.profiles.clone(),
            temp_root,
            socket_dir: std::env::temp_dir(),
            policy: policy.clone(),
        };
        let worker = Worker::new(
            Arc::clone(&registry),
            queue,
            context,
            config.queue.max_concurrent_tasks,
        );

        let processor = Self {
            shared: Arc::new(Shared {
                config,
                registry,
                resolver,
                auto_reject,
                policy,
            }),
        };
        (processor, worker)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.shared.config.profiles
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.shared.registry.list().await
    }

    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.shared.registry.get(id).await
    }

    /// Queue one file. The profile is checked when the task runs.
    pub async fn submit_task(&self, input: PathBuf, profile: String) -> Result<TaskId, SubmitError> {
        self.shared.registry.submit(input, profile).await
    }

    /// Queue every video file under `dir`.
    ///
    /// Files with an active task for the same profile, or whose streams use
    /// one of the profile's excluded codecs, are skipped.
    pub async fn submit_directory(&self, dir: &Path, profile_name: &str) -> Result<BatchReport, SubmitError> {
        let profile = self
            .shared
            .config
            .get_profile(profile_name)
            .ok_or_else(|| SubmitError::UnknownProfile(profile_name.to_string()))?;

        let root = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .map_err(|e| SubmitError::Scan {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?
            .map_err(|e| SubmitError::Scan {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(dir = %dir.display(), profile = profile_name, files = files.len(), "batch submission");

        let mut report = BatchReport::default();
        for path in files {
            if !profile.batch_exclude_codecs.is_empty() {
                match probe_media(&self.shared.config.encoder, &path).await {
                    Ok(probe) if probe.uses_any_codec(&profile.batch_exclude_codecs) => {
                        info!(file = %path.display(), "skipping file due to codec filter");
                        report.skipped_excluded.push(path);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "cannot apply codec filter");
                        report.failed.push(BatchFailure {
                            path,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                }
            }

            if self.shared.registry.has_active_task(&path, profile_name).await {
                info!(file = %path.display(), profile = profile_name, "skipping file, task already exists");
                report.skipped_existing.push(path);
                continue;
            }

            match self.submit_task(path.clone(), profile_name.to_string()).await {
                Ok(id) => report.submitted.push(id),
                Err(e) => report.failed.push(BatchFailure {
                    path,
                    reason: e.to_string(),
                }),
            }
        }

        Ok(report)
    }

    /// Request cancellation. Returns false for tasks that already finished.
    pub async fn cancel_task(&self, id: TaskId) -> Result<bool, RegistryError> {
        self.shared.registry.cancel(id).await
    }

    /// Start resolving a task waiting for a decision; see [`Resolver::resolve`].
    pub async fn resolve_task(&self, id: TaskId, replace: bool) -> Result<JoinHandle<()>, ResolveError> {
        self.shared.resolver.resolve(id, replace).await
    }

    pub fn auto_reject_enabled(&self) -> bool {
        self.shared.auto_reject.is_enabled()
    }

    /// Toggle auto-reject; switching it on sweeps the waiting tasks right away.
    ///
    /// Returns the number of tasks the sweep resolved.
    pub async fn set_auto_reject(&self, enabled: bool) -> usize {
        let switched_on = self.shared.auto_reject.set_enabled(enabled);
        info!(enabled, "auto-reject updated");
        if switched_on {
            self.shared.policy.sweep().await
        } else {
            0
        }
    }

    /// Periodic policy sweep at the configured interval.
    pub fn spawn_policy_scanner(&self) -> JoinHandle<()> {
        let secs = self.shared.config.auto_reject.scan_interval_secs.max(1);
        spawn_policy_scanner(self.shared.policy.clone(), Duration::from_secs(secs))
    }

    /// Stop accepting tasks. The worker finishes the queued ones and returns.
    pub async fn shutdown(&self) {
        self.shared.registry.close().await;
    }

    /// Request cancellation of every pending or processing task.
    ///
    /// Returns how many requests were made. Used with [`Processor::shutdown`]
    /// so the worker drains quickly and cleans up its temp directories.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for task in self.shared.registry.list().await {
            if !matches!(task.status(), TaskStatus::Pending | TaskStatus::Processing) {
                continue;
            }
            if let Ok(true) = self.shared.registry.cancel(task.id).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled unfinished tasks");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use std::fs;
    use tempfile::TempDir;

    fn config_with_probe(script: &str) -> Config {
        let mut config = Config::default();
        config.encoder = EncoderConfig {
            ffprobe_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "fake-ffprobe".to_string(),
            ],
            ..EncoderConfig::default()
        };
        config
    }

    fn media_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        fs::write(dir.path().join("b.hevc.mkv"), b"b").unwrap();
        fs::write(dir.path().join("readme.txt"), b"c").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_submit_task_defers_profile_check() {
        let (processor, _worker) = Processor::new(Config::default());
        let id = processor
            .submit_task(PathBuf::from("/media/movie.mp4"), "no such profile".to_string())
            .await
            .unwrap();
        assert_eq!(processor.get_task(id).await.unwrap().profile, "no such profile");
    }

    #[tokio::test]
    async fn test_submit_directory_unknown_profile() {
        let (processor, _worker) = Processor::new(Config::default());
        let dir = media_dir();
        assert_eq!(
            processor.submit_directory(dir.path(), "nope").await,
            Err(SubmitError::UnknownProfile("nope".to_string()))
        );
        assert!(processor.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_directory_skips_existing_tasks() {
        let (processor, _worker) = Processor::new(Config::default());
        let dir = media_dir();

        let first = processor.submit_directory(dir.path(), "H264 Slow").await.unwrap();
        assert_eq!(first.submitted.len(), 2);

        let second = processor.submit_directory(dir.path(), "H264 Slow").await.unwrap();
        assert!(second.submitted.is_empty());
        assert_eq!(second.skipped_existing.len(), 2);

        let other = processor.submit_directory(dir.path(), "H264 Ultra Fast").await.unwrap();
        assert_eq!(other.submitted.len(), 2);
    }

    #[tokio::test]
    async fn test_submit_directory_applies_codec_filter() {
        // reports hevc for files whose name mentions it
        let script = r#"for arg; do last=$arg; done
        case "$last" in
            *hevc*) echo '{"streams":[{"codec_type":"video","codec_name":"hevc"}],"format":{"duration":"1"}}' ;;
            *) echo '{"streams":[{"codec_type":"video","codec_name":"h264"}],"format":{"duration":"1"}}' ;;
        esac"#;
        let mut config = config_with_probe(script);
        config.profiles[0].batch_exclude_codecs = vec!["hevc".to_string()];
        let profile = config.profiles[0].name.clone();
        let (processor, _worker) = Processor::new(config);
        let dir = media_dir();

        let report = processor.submit_directory(dir.path(), &profile).await.unwrap();

        assert_eq!(report.submitted.len(), 1);
        assert_eq!(report.skipped_excluded, vec![dir.path().join("b.hevc.mkv")]);
        let task = processor.get_task(report.submitted[0]).await.unwrap();
        assert_eq!(task.input, dir.path().join("a.mp4"));
    }

    #[tokio::test]
    async fn test_submit_directory_missing_dir() {
        let (processor, _worker) = Processor::new(Config::default());
        let result = processor
            .submit_directory(Path::new("/nonexistent/media"), "H264 Slow")
            .await;
        assert!(matches!(result, Err(SubmitError::Scan { .. })));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (processor, _worker) = Processor::new(Config::default());
        assert_eq!(
            processor.cancel_task(TaskId(5)).await,
            Err(RegistryError::NotFound(TaskId(5)))
        );
    }

    #[tokio::test]
    async fn test_shutdown_with_cancel_all_drains_worker() {
        let (processor, worker) = Processor::new(Config::default());
        let mut ids = Vec::new();
        for name in ["/media/a.mp4", "/media/b.mp4", "/media/c.mp4"] {
            ids.push(
                processor
                    .submit_task(PathBuf::from(name), "H264 Slow".to_string())
                    .await
                    .unwrap(),
            );
        }

        processor.shutdown().await;
        assert_eq!(processor.cancel_all().await, 3);
        assert_eq!(processor.cancel_all().await, 3);

        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker should drain after shutdown");
        for id in ids {
            assert_eq!(processor.get_task(id).await.unwrap().status(), TaskStatus::Cancelled);
        }
        assert_eq!(processor.cancel_all().await, 0);
    }

    #[tokio::test]
    async fn test_auto_reject_toggle() {
        let (processor, _worker) = Processor::new(Config::default());
        assert!(!processor.auto_reject_enabled());
        assert_eq!(processor.set_auto_reject(true).await, 0);
        assert!(processor.auto_reject_enabled());
        processor.set_auto_reject(false).await;
        assert!(!processor.auto_reject_enabled());
    }
}
