//! In-memory task store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::table::TaskTable;
use crate::core::task::{ErrorSnapshot, NewTask, TaskFilter, TaskRecord, TaskStatus};
use crate::core::{SchedulerError, TaskStore};
use crate::util::serde::TaskId;

/// Volatile task store for tests, demos and single-process deployments.
///
/// A single mutex guards the whole table, so every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    table: Mutex<TaskTable>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.table.lock().records().len()
    }

    /// Whether the store holds no task.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_task(&self, task: NewTask, now: u64) -> Result<TaskRecord, SchedulerError> {
        let record = TaskRecord::from_new(task, now);
        self.table.lock().insert(record.clone());
        Ok(record)
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<(), SchedulerError> {
        self.table.lock().insert(task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        Ok(self.table.lock().get(id))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, SchedulerError> {
        Ok(self.table.lock().list(filter))
    }

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, SchedulerError> {
        Ok(self.table.lock().status_counts())
    }

    async fn reset_tasks(&self, retryable_codes: &[String], now: u64) -> Result<usize, SchedulerError> {
        self.table.lock().reset(retryable_codes, now)
    }

    async fn parallel_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        Ok(self.table.lock().parallel(codes, task_limit))
    }

    async fn sequence_tasks(
        &self,
        codes: &[String],
        task_limit: usize,
    ) -> Result<Vec<TaskRecord>, SchedulerError> {
        Ok(self.table.lock().sequence(codes, task_limit))
    }

    async fn start_task(&self, task: &TaskRecord, now: u64) -> Result<TaskRecord, SchedulerError> {
        self.table.lock().start(task, now)
    }

    async fn finish_task(
        &self,
        task: &TaskRecord,
        result: Value,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.table.lock().finish(task, result, now)
    }

    async fn fail_task(
        &self,
        task: &TaskRecord,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.table.lock().fail(task, error, activity_retryable, now)
    }

    async fn expire_tasks(&self, finished_before: u64) -> Result<usize, SchedulerError> {
        Ok(self.table.lock().expire(finished_before))
    }
}
