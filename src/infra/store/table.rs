//! In-process task table shared by the memory and file stores.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::core::admission::{select_parallel, select_sequence};
use crate::core::task::{ErrorSnapshot, TaskFilter, TaskRecord, TaskStatus};
use crate::core::SchedulerError;
use crate::util::serde::TaskId;

/// Task rows keyed by id. Callers hold the lock around every method so each
/// call is one atomic mutation.
#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    tasks: HashMap<TaskId, TaskRecord>,
}

impl TaskTable {
    pub(crate) fn from_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            tasks: records.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Rows in creation order, the order the file store persists them in.
    pub(crate) fn records(&self) -> Vec<&TaskRecord> {
        let mut rows: Vec<_> = self.tasks.values().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    pub(crate) fn insert(&mut self, task: TaskRecord) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(id).cloned()
    }

    pub(crate) fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        self.records()
            .into_iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub(crate) fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn reset(&mut self, retryable_codes: &[String], now: u64) -> Result<usize, SchedulerError> {
        let retryable: HashSet<&str> = retryable_codes.iter().map(String::as_str).collect();
        let mut touched = 0;
        for task in self.tasks.values_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }
            task.mark_reset(retryable.contains(task.activity_code.as_str()), now)?;
            touched += 1;
        }
        Ok(touched)
    }

    pub(crate) fn parallel(&self, codes: &[String], task_limit: usize) -> Vec<TaskRecord> {
        select_parallel(self.tasks.values(), codes, task_limit)
    }

    pub(crate) fn sequence(&self, codes: &[String], task_limit: usize) -> Vec<TaskRecord> {
        select_sequence(self.tasks.values(), codes, task_limit)
    }

    /// Row for a versioned write: present and still at the caller's version.
    fn versioned(&mut self, task: &TaskRecord) -> Result<&mut TaskRecord, SchedulerError> {
        let stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.id.clone()))?;
        if stored.updated_at != task.updated_at {
            return Err(SchedulerError::StaleTask(task.id.clone()));
        }
        Ok(stored)
    }

    /// Apply `write` to a copy and store it only if it succeeds.
    fn update(
        &mut self,
        task: &TaskRecord,
        write: impl FnOnce(&mut TaskRecord) -> Result<(), SchedulerError>,
    ) -> Result<TaskRecord, SchedulerError> {
        let stored = self.versioned(task)?;
        let mut next = stored.clone();
        write(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    pub(crate) fn start(&mut self, task: &TaskRecord, now: u64) -> Result<TaskRecord, SchedulerError> {
        self.update(task, |t| t.mark_running(now))
    }

    pub(crate) fn finish(
        &mut self,
        task: &TaskRecord,
        result: Value,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.update(task, |t| t.mark_finished(result, now))
    }

    pub(crate) fn fail(
        &mut self,
        task: &TaskRecord,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.update(task, |t| t.mark_failed(error, activity_retryable, now).map(|_| ()))
    }

    pub(crate) fn expire(&mut self, finished_before: u64) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.status == TaskStatus::Finished && t.finished_at.is_some_and(|at| at < finished_before))
        });
        before - self.tasks.len()
    }
}
