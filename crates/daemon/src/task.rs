//! Task model and lifecycle state machine.
//!
//! A [`Task`] is one submitted transcoding job. Its status only moves along the
//! edges accepted by [`TaskStatus::can_transition_to`]; every `mark_*` method
//! checks the edge and refuses anything else with a [`TransitionError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Monotonically increasing task identifier. The first task gets id 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is queued and waiting for the worker.
    Pending,
    /// The worker owns the task (probe, encode).
    Processing,
    /// Encoding succeeded; a keep/replace decision is needed.
    WaitingForResolution,
    /// A resolution is being applied in the background.
    Replacing,
    /// Task finished and its resolution was applied.
    Completed,
    /// Task was cancelled.
    Cancelled,
    /// Task failed; see the task's error.
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::WaitingForResolution,
        TaskStatus::Replacing,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::WaitingForResolution => "waiting_for_resolution",
            TaskStatus::Replacing => "replacing",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed, cancelled and failed tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// The lifecycle edge table.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, WaitingForResolution)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (WaitingForResolution, Replacing)
                | (Replacing, Completed)
                | (Replacing, Failed)
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refused status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for task {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A task's temp output can only be recorded once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {id} already has a temp output at {}", .existing.display())]
pub struct TempOutputAlreadySet {
    pub id: TaskId,
    pub existing: PathBuf,
}

/// Cancellation progress of a task.
///
/// `Requested` is set by whoever calls cancel; only the worker moves it to
/// `Observed`, at its checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Cancellation {
    NotRequested,
    Requested { at: i64 },
    Observed { requested_at: i64, observed_at: i64 },
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::NotRequested
    }
}

/// A transcoding task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    /// Source file; also the replacement destination.
    pub input: PathBuf,
    /// Name of the profile to encode with.
    pub profile: String,
    /// Encoder output, set once when processing begins.
    temp_output: Option<PathBuf>,
    /// Only changed by the `mark_*` methods.
    status: TaskStatus,
    /// Completion fraction in [0.0, 1.0].
    pub progress: f64,
    /// Failure reason; present only when `status` is `failed`.
    pub error: Option<String>,
    pub cancellation: Cancellation,
    /// Unix timestamps in milliseconds.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Task {
    pub fn new(id: TaskId, input: PathBuf, profile: String) -> Self {
        Self {
            id,
            input,
            profile,
            temp_output: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            error: None,
            cancellation: Cancellation::NotRequested,
            created_at: current_timestamp_ms(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn temp_output(&self) -> Option<&Path> {
        self.temp_output.as_deref()
    }

    /// Record where the encoder writes its output.
    pub fn set_temp_output(&mut self, path: PathBuf) -> Result<(), TempOutputAlreadySet> {
        if let Some(existing) = &self.temp_output {
            return Err(TempOutputAlreadySet {
                id: self.id,
                existing: existing.clone(),
            });
        }
        self.temp_output = Some(path);
        Ok(())
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(current_timestamp_ms());
        }
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Processing)?;
        self.started_at = Some(current_timestamp_ms());
        Ok(())
    }

    pub fn mark_waiting_for_resolution(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::WaitingForResolution)?;
        self.progress = 1.0;
        self.ended_at = Some(current_timestamp_ms());
        Ok(())
    }

    pub fn mark_replacing(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Replacing)
    }

    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed)
    }

    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Cancelled)
    }

    /// Mark the task as failed with a reason.
    pub fn mark_failed(&mut self, reason: impl fmt::Display) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(reason.to_string());
        Ok(())
    }

    /// Record a progress report. Only applies while processing; values are
    /// clamped to [0, 1] and never lower the current progress.
    pub fn record_progress(&mut self, fraction: f64) {
        if self.status != TaskStatus::Processing || fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
        }
    }

    /// Ask for cancellation. Returns false when the task already reached a
    /// terminal status (nothing to cancel).
    pub fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.cancellation == Cancellation::NotRequested {
            self.cancellation = Cancellation::Requested {
                at: current_timestamp_ms(),
            };
        }
        true
    }

    pub fn cancel_requested(&self) -> bool {
        !matches!(self.cancellation, Cancellation::NotRequested)
    }

    /// Worker checkpoint: consume a pending cancel request.
    ///
    /// Returns true if cancellation was requested (now or at an earlier checkpoint).
    pub fn observe_cancel(&mut self) -> bool {
        match self.cancellation {
            Cancellation::NotRequested => false,
            Cancellation::Requested { at } => {
                self.cancellation = Cancellation::Observed {
                    requested_at: at,
                    observed_at: current_timestamp_ms(),
                };
                true
            }
            Cancellation::Observed { .. } => true,
        }
    }

    /// Duration spent in processing, in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or_else(current_timestamp_ms);
        Some((end - started).max(0))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or processing and not being cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Processing)
            && !self.cancel_requested()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {}: {} (Status: {}, Progress: {:.1}%)",
            self.id,
            self.input.display(),
            self.status,
            self.progress * 100.0
        )
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_task() -> Task {
        Task::new(
            TaskId(1),
            PathBuf::from("/media/movies/movie.mp4"),
            "H264-fast".to_string(),
        )
    }

    fn status_strategy() -> impl Strategy<Value = TaskStatus> {
        proptest::sample::select(TaskStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Terminal statuses have no outgoing edges.
        #[test]
        fn prop_terminal_status_has_no_exit(from in status_strategy(), to in status_strategy()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        // Progress never decreases and always stays inside [0, 1].
        #[test]
        fn prop_progress_monotonic_and_clamped(reports in prop::collection::vec(-2.0f64..3.0, 1..50)) {
            let mut task = make_task();
            task.mark_processing().unwrap();

            let mut previous = task.progress;
            for report in reports {
                task.record_progress(report);
                prop_assert!(task.progress >= previous);
                prop_assert!((0.0..=1.0).contains(&task.progress));
                previous = task.progress;
            }
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(
            TaskStatus::WaitingForResolution.to_string(),
            "waiting_for_resolution"
        );
        assert_eq!(TaskStatus::Replacing.to_string(), "replacing");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(TaskStatus::default(), TaskStatus::Pending);
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = make_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.temp_output.is_none());
        assert!(task.error.is_none());
        assert!(task.created_at > 0);
        assert!(task.started_at.is_none());
        assert!(task.duration_ms().is_none());
        assert!(task.is_active());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = make_task();
        task.mark_processing().unwrap();
        assert!(task.started_at.is_some());

        task.record_progress(0.4);
        task.mark_waiting_for_resolution().unwrap();
        assert_eq!(task.progress, 1.0);

        task.mark_replacing().unwrap();
        task.mark_completed().unwrap();
        assert!(task.is_terminal());
        assert!(task.ended_at.is_some());
        assert!(task.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_invalid_transition_leaves_status() {
        let mut task = make_task();
        let err = task.mark_replacing().unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Replacing);
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_processing().unwrap();
        task.mark_cancelled().unwrap();
        assert!(task.mark_processing().is_err());
        assert!(task.mark_failed("late").is_err());
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_temp_output_is_set_once() {
        let mut task = make_task();
        task.set_temp_output(PathBuf::from("/tmp/task-1-a/movie.mp4")).unwrap();

        let err = task
            .set_temp_output(PathBuf::from("/tmp/task-1-b/movie.mp4"))
            .unwrap_err();
        assert_eq!(err.existing, PathBuf::from("/tmp/task-1-a/movie.mp4"));
        assert_eq!(task.temp_output(), Some(Path::new("/tmp/task-1-a/movie.mp4")));
    }

    #[test]
    fn test_failed_records_reason() {
        let mut task = make_task();
        task.mark_processing().unwrap();
        task.mark_failed("probe failed: no such file").unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("probe failed: no such file"));
    }

    #[test]
    fn test_progress_ignored_outside_processing() {
        let mut task = make_task();
        task.record_progress(0.5);
        assert_eq!(task.progress, 0.0);

        task.mark_processing().unwrap();
        task.record_progress(f64::NAN);
        assert_eq!(task.progress, 0.0);
        task.record_progress(0.25);
        task.record_progress(0.1);
        assert_eq!(task.progress, 0.25);
    }

    #[test]
    fn test_cancellation_request_then_observe() {
        let mut task = make_task();
        assert!(!task.observe_cancel());

        assert!(task.request_cancel());
        assert!(task.cancel_requested());
        assert!(!task.is_active());
        assert!(matches!(task.cancellation, Cancellation::Requested { .. }));

        assert!(task.observe_cancel());
        assert!(matches!(task.cancellation, Cancellation::Observed { .. }));
        // A second checkpoint still sees it.
        assert!(task.observe_cancel());
    }

    #[test]
    fn test_cancel_request_on_terminal_task_is_noop() {
        let mut task = make_task();
        task.mark_processing().unwrap();
        task.mark_failed("boom").unwrap();

        assert!(!task.request_cancel());
        assert_eq!(task.cancellation, Cancellation::NotRequested);
    }

    #[test]
    fn test_task_json_uses_snake_case_status() {
        let task = make_task();
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"state\":\"not_requested\""));
    }
}
