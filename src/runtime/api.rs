//! API-facing request/response models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    ActivityMode, NewTaskRequest, Scheduler, SchedulerError, Spawn, TaskRecord, TaskStatus,
};
use crate::util::serde::TaskId;

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Activity that processes the task.
    pub activity_code: String,
    /// Opaque input.
    #[serde(default)]
    pub input: Value,
}

/// Task status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task identifier.
    pub task_id: TaskId,
    /// Owning activity.
    pub activity_code: String,
    /// Current status.
    pub status: TaskStatus,
    /// Result once FINISHED.
    pub result: Option<Value>,
    /// Failure message once failed.
    pub reason: Option<String>,
    /// Failures so far.
    pub retry_times: u32,
    /// Creation time (ms since epoch).
    pub created_at_ms: u64,
    /// Last write (ms since epoch).
    pub updated_at_ms: u64,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            task_id: task.id,
            activity_code: task.activity_code,
            status: task.status,
            result: task.result,
            reason: task.error.map(|e| e.message),
            retry_times: task.retry_times,
            created_at_ms: task.created_at,
            updated_at_ms: task.updated_at,
        }
    }
}

/// Activity listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Activity code.
    pub code: String,
    /// Concurrency mode.
    pub mode: ActivityMode,
    /// Retry allowed.
    pub retryable: bool,
    /// Idle priority.
    pub priority: u8,
    /// Failure bound.
    pub max_retry_times: Option<u32>,
}

/// Scheduler snapshot for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Tasks per status name.
    pub counts: BTreeMap<String, usize>,
    /// Registered activities, ordered by code.
    pub activities: Vec<ActivitySnapshot>,
    /// Per-pool slot budget.
    pub task_limit: usize,
    /// Whether the timer loop runs.
    pub started: bool,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Store backend name.
    pub backend: String,
    /// Store error when unhealthy.
    pub detail: Option<String>,
}

/// Submit a task to a scheduler.
pub async fn submit_task<S>(scheduler: &Scheduler<S>, req: TaskSubmission) -> Result<TaskView, String>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    scheduler
        .create_task(NewTaskRequest::new(req.activity_code, req.input))
        .await
        .map(TaskView::from)
        .map_err(|e| e.to_string())
}

/// Current state of one task.
pub async fn task_status<S>(scheduler: &Scheduler<S>, task_id: &TaskId) -> Result<TaskView, String>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    scheduler
        .get_task(task_id)
        .await
        .and_then(|t| t.ok_or_else(|| SchedulerError::TaskNotFound(task_id.clone())))
        .map(TaskView::from)
        .map_err(|e| e.to_string())
}

/// Counts and activity listing.
pub async fn snapshot<S>(scheduler: &Scheduler<S>) -> Result<SchedulerSnapshot, String>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let stats = scheduler.stats().await.map_err(|e| e.to_string())?;
    let counts = TaskStatus::ALL
        .into_iter()
        .map(|s| (s.as_str().to_string(), stats.counts.get(&s).copied().unwrap_or(0)))
        .collect();
    let activities = scheduler
        .registry()
        .all()
        .iter()
        .map(|a| ActivitySnapshot {
            code: a.code().to_string(),
            mode: a.mode(),
            retryable: a.retryable(),
            priority: a.priority().value(),
            max_retry_times: a.max_retry_times(),
        })
        .collect();
    Ok(SchedulerSnapshot {
        counts,
        activities,
        task_limit: stats.task_limit,
        started: stats.started,
    })
}

/// Probe the store and report health.
pub async fn health<S>(scheduler: &Scheduler<S>) -> Health
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    let backend = scheduler.store().backend().to_string();
    match scheduler.store().status_counts().await {
        Ok(_) => Health {
            ok: true,
            backend,
            detail: None,
        },
        Err(e) => Health {
            ok: false,
            backend,
            detail: Some(e.to_string()),
        },
    }
}
