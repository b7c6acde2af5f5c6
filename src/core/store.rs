//! The task store contract every persistence backend satisfies.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::task::{ErrorSnapshot, NewTask, TaskFilter, TaskRecord, TaskStatus};
use crate::core::SchedulerError;
use crate::util::serde::TaskId;

/// Durable task table with the selection queries used by admission.
///
/// Every mutation must be atomic with respect to the fields it touches.
/// `start_task` is a compare-and-swap on `(id, updated_at)` and is the only
/// guard against two schedulers dispatching the same task.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Insert an IDLE task.
    async fn create_task(&self, task: NewTask, now: u64) -> Result<TaskRecord, SchedulerError>;

    /// Insert a record verbatim (imports and recovery drills).
    async fn insert_task(&self, task: TaskRecord) -> Result<(), SchedulerError>;

    /// Fetch one task.
    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError>;

    /// List tasks matching a filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, SchedulerError>;

    /// Number of tasks per status.
    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, SchedulerError>;

    /// Reclassify every RUNNING task: TEMPORARILY_FAILED when its activity is
    /// in `retryable_codes` and its retry bound allows it, FAILED otherwise.
    /// Returns the number of tasks touched.
    async fn reset_tasks(&self, retryable_codes: &[String], now: u64)
        -> Result<usize, SchedulerError>;

    /// Runnable tasks of the parallel pool made of `codes`.
    async fn parallel_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError>;

    /// Runnable tasks of a one-per-code pool made of `codes`.
    async fn sequence_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError>;

    /// Move a task to RUNNING if its version still equals `task.updated_at`.
    async fn start_task(&self, task: &TaskRecord, now: u64) -> Result<TaskRecord, SchedulerError>;

    /// Record a successful result.
    async fn finish_task(
        &self,
        task: &TaskRecord,
        result: Value,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError>;

    /// Record a failure; the status follows the retry policy.
    async fn fail_task(
        &self,
        task: &TaskRecord,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError>;

    /// Delete FINISHED tasks whose `finished_at` is before `finished_before`.
    async fn expire_tasks(&self, finished_before: u64) -> Result<usize, SchedulerError>;
}
