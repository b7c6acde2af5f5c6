//! Admission: which runnable tasks may move to RUNNING this cycle.
//!
//! Selection is split in two layers. The pure functions in this module encode
//! the ordering and slot rules once; every [`TaskStore`] feeds them candidates
//! (in-process stores straight from their tables, SQL stores from pre-ordered
//! queries). [`AdmissionEngine`] sits on top and asks the store for each
//! concurrency pool.
//!
//! Each pool computes its free slots from the RUNNING tasks of its own
//! activity codes only, so pools admitted in the same cycle can together
//! exceed `task_limit`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::activity::{ActivityMode, ActivityRegistry};
use crate::core::store::TaskStore;
use crate::core::task::{TaskRecord, TaskStatus};
use crate::core::SchedulerError;

/// Free slots left in a pool.
pub const fn remaining_slots(task_limit: usize, running: usize) -> usize {
    task_limit.saturating_sub(running)
}

/// Retry order: oldest failure first, then oldest task.
pub fn retry_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    a.failed_at
        .cmp(&b.failed_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Idle order: highest priority first, then FIFO.
pub fn idle_order(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Parallel pool selection from pre-filtered candidates.
///
/// `retry_candidates` and `idle_candidates` must already be restricted to
/// the pool's activity codes and to TEMPORARILY_FAILED / IDLE respectively.
pub fn select_parallel_from(
    running: usize,
    mut retry_candidates: Vec<TaskRecord>,
    mut idle_candidates: Vec<TaskRecord>,
    task_limit: usize,
) -> Vec<TaskRecord> {
    let mut remaining = remaining_slots(task_limit, running);
    if remaining == 0 {
        return Vec::new();
    }

    retry_candidates.sort_by(retry_order);
    retry_candidates.truncate(remaining);
    remaining -= retry_candidates.len();

    let mut runnable = retry_candidates;
    if remaining == 0 {
        return runnable;
    }

    idle_candidates.sort_by(idle_order);
    runnable.extend(idle_candidates.into_iter().take(remaining));
    runnable
}

/// Sequence pool selection from pre-filtered candidates.
///
/// At most one task per activity code is admitted and codes that already
/// have a RUNNING task are skipped. Retry candidates claim their code first;
/// the merged set is then ordered by priority and age and cut to the free
/// slots.
pub fn select_sequence_from(
    codes: &[String],
    running_codes: &[String],
    mut retry_candidates: Vec<TaskRecord>,
    mut idle_candidates: Vec<TaskRecord>,
    task_limit: usize,
) -> Vec<TaskRecord> {
    let remaining = remaining_slots(task_limit, running_codes.len());
    if codes.is_empty() || remaining == 0 {
        return Vec::new();
    }

    let mut free: HashSet<&str> = codes.iter().map(String::as_str).collect();
    for code in running_codes {
        free.remove(code.as_str());
    }

    let mut candidates = Vec::new();

    retry_candidates.sort_by(retry_order);
    for task in retry_candidates {
        if free.remove(task.activity_code.as_str()) {
            candidates.push(task);
            if candidates.len() >= remaining {
                break;
            }
        }
    }

    idle_candidates.sort_by(idle_order);
    for task in idle_candidates {
        if free.remove(task.activity_code.as_str()) {
            candidates.push(task);
        }
    }

    candidates.sort_by(idle_order);
    candidates.truncate(remaining);
    candidates
}

/// Parallel pool selection straight from a task table.
pub fn select_parallel<'a>(
    tasks: impl IntoIterator<Item = &'a TaskRecord>,
    codes: &[String],
    task_limit: usize,
) -> Vec<TaskRecord> {
    if codes.is_empty() {
        return Vec::new();
    }
    let pool = PoolSlice::collect(tasks, codes);
    select_parallel_from(pool.running.len(), pool.retry, pool.idle, task_limit)
}

/// Sequence (or batch) pool selection straight from a task table.
pub fn select_sequence<'a>(
    tasks: impl IntoIterator<Item = &'a TaskRecord>,
    codes: &[String],
    task_limit: usize,
) -> Vec<TaskRecord> {
    if codes.is_empty() {
        return Vec::new();
    }
    let pool = PoolSlice::collect(tasks, codes);
    select_sequence_from(codes, &pool.running, pool.retry, pool.idle, task_limit)
}

/// Tasks of one pool split by the statuses admission cares about.
struct PoolSlice {
    running: Vec<String>,
    retry: Vec<TaskRecord>,
    idle: Vec<TaskRecord>,
}

impl PoolSlice {
    fn collect<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>, codes: &[String]) -> Self {
        let codes: HashSet<&str> = codes.iter().map(String::as_str).collect();
        let mut slice = Self {
            running: Vec::new(),
            retry: Vec::new(),
            idle: Vec::new(),
        };
        for task in tasks {
            if !codes.contains(task.activity_code.as_str()) {
                continue;
            }
            match task.status {
                TaskStatus::Running => slice.running.push(task.activity_code.clone()),
                TaskStatus::TemporarilyFailed => slice.retry.push(task.clone()),
                TaskStatus::Idle => slice.idle.push(task.clone()),
                TaskStatus::Failed | TaskStatus::Finished => {}
            }
        }
        slice
    }
}

/// Asks the store for the runnable tasks of each concurrency pool.
#[derive(Clone)]
pub struct AdmissionEngine {
    registry: Arc<ActivityRegistry>,
    store: Arc<dyn TaskStore>,
    task_limit: usize,
}

impl AdmissionEngine {
    /// Create an engine with a per-pool slot budget.
    pub fn new(registry: Arc<ActivityRegistry>, store: Arc<dyn TaskStore>, task_limit: usize) -> Self {
        Self {
            registry,
            store,
            task_limit,
        }
    }

    /// Per-pool slot budget.
    pub const fn task_limit(&self) -> usize {
        self.task_limit
    }

    /// Runnable tasks of one pool for this cycle.
    pub async fn admit(&self, mode: ActivityMode) -> Result<Vec<TaskRecord>, SchedulerError> {
        let codes = self.registry.codes_by_mode(mode);
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let runnable = match mode {
            ActivityMode::Parallel => self.store.parallel_tasks(&codes, self.task_limit).await?,
            ActivityMode::Sequence | ActivityMode::Batch => {
                self.store.sequence_tasks(&codes, self.task_limit).await?
            }
        };
        tracing::debug!(pool = %mode, admitted = runnable.len(), "admission computed");
        Ok(runnable)
    }
}
