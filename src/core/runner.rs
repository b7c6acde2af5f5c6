//! Task runner: claims admitted tasks and runs their activity detached.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::FutureExt;
use serde_json::Value;

use crate::core::activity::ActivityRegistry;
use crate::core::audit::{build_audit_event, record_audit, AuditAction, SharedAuditSink};
use crate::core::store::TaskStore;
use crate::core::task::{ProcessError, TaskRecord};
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::serde::TaskId;

/// Tries per outcome write before the task is left RUNNING.
const OUTCOME_WRITE_ATTEMPTS: usize = 2;

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Receives the final record of a detached task.
#[derive(Debug)]
pub struct Completion {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskRecord>,
}

impl Completion {
    /// Task this completion belongs to.
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the outcome. `None` when the outcome could not be written.
    pub async fn wait(self) -> Option<TaskRecord> {
        self.rx.await.ok()
    }
}

/// What one dispatch pass did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Tasks claimed and handed to their activity.
    pub started: Vec<TaskId>,
    /// Tasks another cycle claimed first.
    pub stale: Vec<TaskId>,
    /// Tasks whose start failed for another reason.
    pub errored: Vec<(TaskId, String)>,
    /// One completion per started task.
    pub completions: Vec<Completion>,
}

impl DispatchReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.started.extend(other.started);
        self.stale.extend(other.stale);
        self.errored.extend(other.errored);
        self.completions.extend(other.completions);
    }
}

/// Starts tasks with an optimistic claim and records their outcome.
pub struct TaskRunner<S> {
    registry: Arc<ActivityRegistry>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    spawner: S,
    audit: Option<SharedAuditSink>,
}

impl<S: Clone> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            spawner: self.spawner.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S> TaskRunner<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Create a runner.
    pub fn new(
        registry: Arc<ActivityRegistry>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        spawner: S,
        audit: Option<SharedAuditSink>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            spawner,
            audit,
        }
    }

    /// Claim a task: CAS to RUNNING keyed by its version.
    pub async fn start(&self, task: &TaskRecord) -> Result<TaskRecord, SchedulerError> {
        let started = self.store.start_task(task, self.clock.now_ms()).await?;
        record_audit(
            self.audit.as_ref(),
            build_audit_event(started.id.as_str(), &started.activity_code, AuditAction::Start, None),
        );
        Ok(started)
    }

    /// Claim a task and run its activity detached.
    pub async fn dispatch(&self, task: &TaskRecord) -> Result<Completion, SchedulerError> {
        let started = self.start(task).await?;
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            task_id: started.id.clone(),
            rx,
        };

        let runner = self.clone();
        self.spawner.spawn(async move {
            let task_id = started.id.clone();
            match runner.execute(started).await {
                Ok(record) => {
                    let _ = tx.send(record);
                }
                Err(e) => {
                    tracing::error!(task = %task_id, error = %e, "failed to record task outcome");
                }
            }
        });

        Ok(completion)
    }

    /// Dispatch a batch. A failed start never aborts its siblings.
    pub async fn dispatch_all(&self, tasks: Vec<TaskRecord>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for task in tasks {
            match self.dispatch(&task).await {
                Ok(completion) => {
                    report.started.push(task.id);
                    report.completions.push(completion);
                }
                Err(SchedulerError::StaleTask(id)) => {
                    tracing::debug!(task = %id, "task claimed elsewhere, skipping");
                    record_audit(
                        self.audit.as_ref(),
                        build_audit_event(id.as_str(), &task.activity_code, AuditAction::Stale, None),
                    );
                    report.stale.push(id);
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "failed to start task");
                    report.errored.push((task.id, e.to_string()));
                }
            }
        }
        report
    }

    /// Run the process function and write the outcome.
    ///
    /// A storage error on the outcome write is retried once. If it persists the
    /// task stays RUNNING, holding its slot until recovery on the next process
    /// start.
    async fn execute(&self, task: TaskRecord) -> Result<TaskRecord, SchedulerError> {
        let Some(activity) = self.registry.get(&task.activity_code) else {
            let err = ProcessError::terminal(format!("activity not found: {}", task.activity_code));
            return self.write_outcome(&task, Err(err), false).await;
        };

        tracing::debug!(task = %task.id, activity = %task.activity_code, "processing task");
        let process = activity.process();
        let outcome = AssertUnwindSafe(process.process(task.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessError::terminal(panic_message(&*panic))));

        self.write_outcome(&task, outcome, activity.retryable()).await
    }

    async fn write_outcome(
        &self,
        task: &TaskRecord,
        outcome: Result<Value, ProcessError>,
        activity_retryable: bool,
    ) -> Result<TaskRecord, SchedulerError> {
        let mut attempt = 1;
        loop {
            let written = match &outcome {
                Ok(result) => self.finish(task, result.clone()).await,
                Err(err) => self.fail(task, err, activity_retryable).await,
            };
            match written {
                Err(SchedulerError::StorageUnavailable(e)) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                    tracing::warn!(task = %task.id, attempt, error = %e, "outcome write failed, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Record success.
    pub async fn finish(&self, task: &TaskRecord, result: Value) -> Result<TaskRecord, SchedulerError> {
        let finished = self
            .store
            .finish_task(task, result, self.clock.now_ms())
            .await?;
        tracing::info!(task = %finished.id, activity = %finished.activity_code, "task finished");
        record_audit(
            self.audit.as_ref(),
            build_audit_event(finished.id.as_str(), &finished.activity_code, AuditAction::Finish, None),
        );
        Ok(finished)
    }

    /// Record failure; the store applies the retry policy.
    pub async fn fail(
        &self,
        task: &TaskRecord,
        err: &ProcessError,
        activity_retryable: bool,
    ) -> Result<TaskRecord, SchedulerError> {
        let failed = self
            .store
            .fail_task(task, err.snapshot(), activity_retryable, self.clock.now_ms())
            .await?;
        tracing::warn!(
            task = %failed.id,
            activity = %failed.activity_code,
            status = %failed.status,
            retry_times = failed.retry_times,
            error = %err,
            "task failed"
        );
        record_audit(
            self.audit.as_ref(),
            build_audit_event(
                failed.id.as_str(),
                &failed.activity_code,
                AuditAction::Fail,
                Some(format!("{}: {}", failed.status, err.message)),
            ),
        );
        Ok(failed)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("process panicked: {detail}")
}

#[cfg(all(test, feature = "tokio-runtime"))]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::activity::Activity;
    use crate::core::task::{ErrorSnapshot, NewTask, TaskFilter, TaskStatus};
    use crate::infra::store::InMemoryTaskStore;
    use crate::runtime::TokioSpawner;
    use crate::util::clock::SystemClock;
    use crate::util::serde::Priority;

    /// Memory store whose outcome writes fail a given number of times.
    struct FlakyOutcomes {
        inner: InMemoryTaskStore,
        failures_left: AtomicUsize,
    }

    impl FlakyOutcomes {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryTaskStore::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn trip(&self) -> Result<(), SchedulerError> {
            let tripped = self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                return Err(SchedulerError::storage("database is locked"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TaskStore for FlakyOutcomes {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn create_task(&self, task: NewTask, now: u64) -> Result<TaskRecord, SchedulerError> {
            self.inner.create_task(task, now).await
        }

        async fn insert_task(&self, task: TaskRecord) -> Result<(), SchedulerError> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
            self.inner.get_task(id).await
        }

        async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, SchedulerError> {
            self.inner.list_tasks(filter).await
        }

        async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, SchedulerError> {
            self.inner.status_counts().await
        }

        async fn reset_tasks(
            &self,
            retryable_codes: &[String],
            now: u64,
        ) -> Result<usize, SchedulerError> {
            self.inner.reset_tasks(retryable_codes, now).await
        }

        async fn parallel_tasks(
            &self,
            codes: &[String],
            task_limit: usize,
        ) -> Result<Vec<TaskRecord>, SchedulerError> {
            self.inner.parallel_tasks(codes, task_limit).await
        }

        async fn sequence_tasks(
            &self,
            codes: &[String],
            task_limit: usize,
        ) -> Result<Vec<TaskRecord>, SchedulerError> {
            self.inner.sequence_tasks(codes, task_limit).await
        }

        async fn start_task(&self, task: &TaskRecord, now: u64) -> Result<TaskRecord, SchedulerError> {
            self.inner.start_task(task, now).await
        }

        async fn finish_task(
            &self,
            task: &TaskRecord,
            result: Value,
            now: u64,
        ) -> Result<TaskRecord, SchedulerError> {
            self.trip()?;
            self.inner.finish_task(task, result, now).await
        }

        async fn fail_task(
            &self,
            task: &TaskRecord,
            error: ErrorSnapshot,
            activity_retryable: bool,
            now: u64,
        ) -> Result<TaskRecord, SchedulerError> {
            self.trip()?;
            self.inner.fail_task(task, error, activity_retryable, now).await
        }

        async fn expire_tasks(&self, finished_before: u64) -> Result<usize, SchedulerError> {
            self.inner.expire_tasks(finished_before).await
        }
    }

    async fn run_one(store: Arc<FlakyOutcomes>) -> (TaskRecord, Option<TaskRecord>) {
        let registry = Arc::new(ActivityRegistry::new());
        registry
            .register(
                Activity::builder("echo")
                    .process_fn(|task| async move { Ok(task.input) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let runner = TaskRunner::new(
            registry,
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::new(SystemClock),
            TokioSpawner::current(),
            None,
        );
        let task = store
            .create_task(
                NewTask {
                    activity_code: "echo".into(),
                    input: json!("payload"),
                    priority: Priority::LOWEST,
                    max_retry_times: None,
                },
                1,
            )
            .await
            .unwrap();
        let settled = runner.dispatch(&task).await.unwrap().wait().await;
        (task, settled)
    }

    #[tokio::test]
    async fn transient_outcome_write_error_is_retried() {
        let store = Arc::new(FlakyOutcomes::new(1));
        let (_, settled) = run_one(Arc::clone(&store)).await;
        let settled = settled.unwrap();
        assert_eq!(settled.status, TaskStatus::Finished);
        assert_eq!(settled.result, Some(json!("payload")));
    }

    #[tokio::test]
    async fn persistent_outcome_write_error_leaves_task_running() {
        let store = Arc::new(FlakyOutcomes::new(OUTCOME_WRITE_ATTEMPTS));
        let (task, settled) = run_one(Arc::clone(&store)).await;
        assert!(settled.is_none());
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }
}
