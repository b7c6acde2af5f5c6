//! Task records, the task state machine and the retry policy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::util::serde::{Priority, TaskId};

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for its first admission.
    Idle,
    /// Claimed by a scheduler and being processed.
    Running,
    /// Failed with a retryable error; eligible for re-admission.
    TemporarilyFailed,
    /// Failed terminally.
    Failed,
    /// Processed successfully.
    Finished,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Running,
        Self::TemporarilyFailed,
        Self::Failed,
        Self::Finished,
    ];

    /// Stable storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::TemporarilyFailed => "TEMPORARILY_FAILED",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// FINISHED and FAILED are never left.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Whether the admission engine may pick a task in this status.
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Idle | Self::TemporarilyFailed)
    }

    /// Transition table of the task state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::TemporarilyFailed, Self::Running)
                | (
                    Self::Running,
                    Self::Finished | Self::TemporarilyFailed | Self::Failed
                )
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The process asked to be retried.
    Retryable,
    /// Anything else.
    Terminal,
}

/// Error raised by an activity's process function.
///
/// Only errors built with [`ProcessError::retryable`] are retried; every other
/// failure, including anything converted from [`anyhow::Error`], is terminal.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessError {
    /// Classification used by the retry policy.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// Optional application error code.
    pub code: Option<String>,
}

impl ProcessError {
    /// Error that asks the scheduler to retry the task.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
            code: None,
        }
    }

    /// Error that fails the task for good.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
            code: None,
        }
    }

    /// Attach an application error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Compact snapshot persisted on the task.
    pub fn snapshot(&self) -> ErrorSnapshot {
        ErrorSnapshot {
            message: self.message.clone(),
            code: self.code.clone(),
            kind: self.kind,
        }
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        Self::terminal(format!("{err:#}"))
    }
}

/// Failure snapshot stored on the task, without stack traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    /// Error message.
    pub message: String,
    /// Optional application error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Classification.
    pub kind: ErrorKind,
}

/// Retry decision shared by the runner and crash recovery.
///
/// A failure becomes `TEMPORARILY_FAILED` only when the error is retryable,
/// the activity is retryable and the retry bound still allows one more attempt.
pub const fn failure_status(
    kind: ErrorKind,
    activity_retryable: bool,
    max_retry_times: Option<u32>,
    retry_times: u32,
) -> TaskStatus {
    let within_bound = match max_retry_times {
        None => true,
        Some(max) => retry_times.saturating_add(1) < max,
    };
    if matches!(kind, ErrorKind::Retryable) && activity_retryable && within_bound {
        TaskStatus::TemporarilyFailed
    } else {
        TaskStatus::Failed
    }
}

/// One persisted execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier.
    pub id: TaskId,
    /// Owning activity.
    pub activity_code: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Opaque input, immutable after creation.
    pub input: Value,
    /// Result, set on FINISHED.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure snapshot, set on FAILED / TEMPORARILY_FAILED.
    #[serde(default)]
    pub error: Option<ErrorSnapshot>,
    /// Priority copied from the activity at creation.
    pub priority: Priority,
    /// Retry bound copied from the activity at creation.
    #[serde(default)]
    pub max_retry_times: Option<u32>,
    /// Number of failure transitions so far.
    #[serde(default)]
    pub retry_times: u32,
    /// Creation time (ms).
    pub created_at: u64,
    /// Last write time (ms); doubles as the optimistic version token.
    pub updated_at: u64,
    /// Last start time (ms).
    #[serde(default)]
    pub running_at: Option<u64>,
    /// Finish time (ms).
    #[serde(default)]
    pub finished_at: Option<u64>,
    /// Last failure time (ms).
    #[serde(default)]
    pub failed_at: Option<u64>,
}

impl TaskRecord {
    /// Build an IDLE record from a creation request.
    pub fn from_new(new: NewTask, now: u64) -> Self {
        Self {
            id: TaskId::generate(),
            activity_code: new.activity_code,
            status: TaskStatus::Idle,
            input: new.input,
            result: None,
            error: None,
            priority: new.priority,
            max_retry_times: new.max_retry_times,
            retry_times: 0,
            created_at: now,
            updated_at: now,
            running_at: None,
            finished_at: None,
            failed_at: None,
        }
    }

    /// Next version token: `now`, but always strictly after the current one.
    pub const fn next_version(&self, now: u64) -> u64 {
        if now > self.updated_at {
            now
        } else {
            self.updated_at + 1
        }
    }

    fn check_transition(&self, next: TaskStatus) -> Result<(), super::SchedulerError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(super::SchedulerError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            })
        }
    }

    /// Apply the start transition in place.
    pub fn mark_running(&mut self, now: u64) -> Result<(), super::SchedulerError> {
        self.check_transition(TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.running_at = Some(now);
        self.updated_at = self.next_version(now);
        Ok(())
    }

    /// Apply the success transition in place.
    pub fn mark_finished(&mut self, result: Value, now: u64) -> Result<(), super::SchedulerError> {
        self.check_transition(TaskStatus::Finished)?;
        self.status = TaskStatus::Finished;
        self.result = Some(result);
        self.finished_at = Some(now);
        self.updated_at = self.next_version(now);
        Ok(())
    }

    /// Apply a failure transition in place; the target status follows
    /// [`failure_status`].
    pub fn mark_failed(
        &mut self,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskStatus, super::SchedulerError> {
        let next = failure_status(
            error.kind,
            activity_retryable,
            self.max_retry_times,
            self.retry_times,
        );
        self.check_transition(next)?;
        self.status = next;
        self.error = Some(error);
        self.retry_times = self.retry_times.saturating_add(1);
        self.failed_at = Some(now);
        self.updated_at = self.next_version(now);
        Ok(next)
    }

    /// Reclassify a task orphaned in RUNNING by a previous process.
    pub fn mark_reset(
        &mut self,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskStatus, super::SchedulerError> {
        let kind = if activity_retryable {
            ErrorKind::Retryable
        } else {
            ErrorKind::Terminal
        };
        self.mark_failed(
            ErrorSnapshot {
                message: RESET_MESSAGE.to_string(),
                code: None,
                kind,
            },
            activity_retryable,
            now,
        )
    }
}

/// Message stored on tasks reclassified by crash recovery.
pub const RESET_MESSAGE: &str = "reset running task";

/// Creation request handed to a store; priority and retry bound are already
/// copied from the activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Owning activity.
    pub activity_code: String,
    /// Opaque input.
    pub input: Value,
    /// Activity priority at creation time.
    pub priority: Priority,
    /// Activity retry bound at creation time.
    pub max_retry_times: Option<u32>,
}

/// Filter for task listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Keep only these statuses (all when empty).
    pub statuses: Vec<TaskStatus>,
    /// Keep only this activity.
    pub activity_code: Option<String>,
}

impl TaskFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            activity_code: None,
        }
    }

    /// Restrict to one activity.
    #[must_use]
    pub fn for_activity(mut self, code: impl Into<String>) -> Self {
        self.activity_code = Some(code.into());
        self
    }

    /// Whether a record passes the filter.
    pub fn matches(&self, task: &TaskRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self
                .activity_code
                .as_deref()
                .is_none_or(|code| code == task.activity_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::from_new(
            NewTask {
                activity_code: "A".into(),
                input: serde_json::json!({ "i": 0 }),
                priority: Priority::LOWEST,
                max_retry_times: Some(2),
            },
            100,
        )
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Idle.can_transition_to(Running));
        assert!(TemporarilyFailed.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(TemporarilyFailed));
        assert!(!Idle.can_transition_to(Finished));
        assert!(!Finished.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn status_round_trips_through_storage_repr() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("TEMPORARY_FAILED"), None);
    }

    #[test]
    fn retry_policy() {
        use ErrorKind::*;
        assert_eq!(failure_status(Retryable, true, None, 40), TaskStatus::TemporarilyFailed);
        assert_eq!(failure_status(Terminal, true, None, 0), TaskStatus::Failed);
        assert_eq!(failure_status(Retryable, false, None, 0), TaskStatus::Failed);
        assert_eq!(failure_status(Retryable, true, Some(2), 0), TaskStatus::TemporarilyFailed);
        assert_eq!(failure_status(Retryable, true, Some(2), 1), TaskStatus::Failed);
        assert_eq!(failure_status(Retryable, true, Some(1), 0), TaskStatus::Failed);
    }

    #[test]
    fn failure_increments_retry_times_and_versions() {
        let mut task = record();
        task.mark_running(100).unwrap();
        assert_eq!(task.updated_at, 101);

        let status = task
            .mark_failed(ProcessError::retryable("boom").snapshot(), true, 150)
            .unwrap();
        assert_eq!(status, TaskStatus::TemporarilyFailed);
        assert_eq!(task.retry_times, 1);
        assert_eq!(task.failed_at, Some(150));

        task.mark_running(160).unwrap();
        let status = task
            .mark_failed(ProcessError::retryable("boom").snapshot(), true, 170)
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(task.retry_times, 2);
        assert!(task.mark_running(180).is_err());
    }

    #[test]
    fn finish_requires_running() {
        let mut task = record();
        assert!(matches!(
            task.mark_finished(Value::Null, 100),
            Err(crate::core::SchedulerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn anyhow_errors_are_terminal() {
        let err: ProcessError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.kind, ErrorKind::Terminal);
        let snap = ProcessError::retryable("later").with_code("ABC").snapshot();
        assert_eq!(snap.code.as_deref(), Some("ABC"));
        assert_eq!(snap.kind, ErrorKind::Retryable);
    }

    #[test]
    fn filter_matches() {
        let task = record();
        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::status(TaskStatus::Idle).for_activity("A").matches(&task));
        assert!(!TaskFilter::status(TaskStatus::Running).matches(&task));
        assert!(!TaskFilter::all().for_activity("B").matches(&task));
    }
}
