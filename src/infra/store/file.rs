//! File-backed task store using a JSON-lines snapshot.
//!
//! The whole table lives in memory and every mutation rewrites the snapshot
//! (write to a sibling temp file, then rename), so a crash leaves either the
//! old or the new table on disk. Suitable for single-process deployments with
//! modest task volumes.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::table::TaskTable;
use crate::core::task::{ErrorSnapshot, NewTask, TaskFilter, TaskRecord, TaskStatus};
use crate::core::{SchedulerError, TaskStore};
use crate::util::serde::TaskId;

/// Durable task store persisted as JSON lines.
pub struct FileTaskStore {
    path: PathBuf,
    table: Mutex<TaskTable>,
}

impl FileTaskStore {
    /// Open the store at `path`, loading any existing snapshot.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(SchedulerError::storage)?;
        }
        let records = Self::load(&path)?;
        tracing::debug!(path = %path.display(), tasks = records.len(), "opened file task store");
        Ok(Self {
            path,
            table: Mutex::new(TaskTable::from_records(records)),
        })
    }

    /// Snapshot location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Vec<TaskRecord>, SchedulerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(SchedulerError::storage)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(SchedulerError::storage)?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn persist(&self, table: &TaskTable) -> Result<(), SchedulerError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(SchedulerError::storage)?;
            let mut writer = BufWriter::new(file);
            for task in table.records() {
                let line = serde_json::to_string(task)?;
                writeln!(writer, "{line}").map_err(SchedulerError::storage)?;
            }
            writer.flush().map_err(SchedulerError::storage)?;
        }
        fs::rename(&tmp, &self.path).map_err(SchedulerError::storage)
    }

    /// Run a mutation and persist the result while still holding the lock.
    /// If the write to disk fails the in-memory table is rolled back by
    /// reloading the last snapshot.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut TaskTable) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut table = self.table.lock();
        let out = op(&mut table)?;
        if let Err(e) = self.persist(&table) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to persist task table");
            *table = TaskTable::from_records(Self::load(&self.path)?);
            return Err(e);
        }
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn create_task(&self, task: NewTask, now: u64) -> Result<TaskRecord, SchedulerError> {
        let record = TaskRecord::from_new(task, now);
        self.mutate(|t| {
            t.insert(record.clone());
            Ok(())
        })?;
        Ok(record)
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<(), SchedulerError> {
        self.mutate(|t| {
            t.insert(task);
            Ok(())
        })
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
        self.mutate(|t| t.reset(retryable_codes, now))
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
        self.mutate(|t| t.start(task, now))
    }

    async fn finish_task(
        &self,
        task: &TaskRecord,
        result: Value,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.mutate(|t| t.finish(task, result, now))
    }

    async fn fail_task(
        &self,
        task: &TaskRecord,
        error: ErrorSnapshot,
        activity_retryable: bool,
        now: u64,
    ) -> Result<TaskRecord, SchedulerError> {
        self.mutate(|t| t.fail(task, error, activity_retryable, now))
    }

    async fn expire_tasks(&self, finished_before: u64) -> Result<usize, SchedulerError> {
        self.mutate(|t| Ok(t.expire(finished_before)))
    }
}
