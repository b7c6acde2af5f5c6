//! The scheduler: submission API, recovery, retention and the cycle loop.
//!
//! One [`Scheduler`] owns its activity registry, store handle, clock and
//! spawner. Several schedulers may live in one process and may share a store;
//! the store's compare-and-swap on start is what keeps them from running a
//! task twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::activity::{Activity, ActivityMode, ActivityRegistry};
use crate::core::admission::AdmissionEngine;
use crate::core::audit::{
    build_audit_event, record_audit, AuditAction, AuditSink, SharedAuditSink,
};
use crate::core::runner::{DispatchReport, Spawn, TaskRunner};
use crate::core::store::TaskStore;
use crate::core::task::{NewTask, TaskFilter, TaskRecord, TaskStatus};
use crate::core::SchedulerError;
use crate::util::clock::{Clock, SystemClock};
use crate::util::serde::TaskId;

/// Default per-pool slot budget.
pub const DEFAULT_TASK_LIMIT: usize = 5;
/// Default timer period.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(5);
/// Default age after which FINISHED tasks are purged.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Tunables of one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Slot budget applied to each pool independently.
    pub task_limit: usize,
    /// Timer period of the cycle loop.
    pub cycle_interval: Duration,
    /// FINISHED tasks older than this are purged.
    pub retention: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            task_limit: DEFAULT_TASK_LIMIT,
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskRequest {
    /// Activity that will process the task.
    pub activity_code: String,
    /// Opaque input handed to the process function.
    #[serde(default)]
    pub input: Value,
}

impl NewTaskRequest {
    /// Build a request.
    pub fn new(activity_code: impl Into<String>, input: Value) -> Self {
        Self {
            activity_code: activity_code.into(),
            input,
        }
    }
}

/// What one timer cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Tasks reclassified by recovery when this cycle ran it; `None` once
    /// recovery is settled.
    pub reset: Option<usize>,
    /// FINISHED tasks purged.
    pub expired: usize,
    /// Admission and dispatch across all pools.
    pub dispatch: DispatchReport,
}

/// Result of a timer firing.
#[derive(Debug)]
pub enum TickOutcome {
    /// A previous cycle was still in flight; nothing was done.
    Busy,
    /// The cycle ran.
    Ran(CycleReport),
    /// The cycle hit an error and was abandoned; the next firing retries.
    Failed(SchedulerError),
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks per status.
    pub counts: HashMap<TaskStatus, usize>,
    /// Registered activities.
    pub activities: usize,
    /// Per-pool slot budget.
    pub task_limit: usize,
    /// Whether the timer loop was started.
    pub started: bool,
}

/// Durable task scheduler.
pub struct Scheduler<S> {
    registry: Arc<ActivityRegistry>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    spawner: S,
    options: SchedulerOptions,
    audit: Option<SharedAuditSink>,
    busy: AtomicBool,
    // `true` once recovery ran or an admission made it unsafe. Held across the
    // reset so no admission interleaves with it.
    recovery_settled: futures::lock::Mutex<bool>,
    started: AtomicBool,
}

/// Clears the busy flag when a cycle ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S> Scheduler<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Create a scheduler with its own empty registry.
    pub fn new(store: Arc<dyn TaskStore>, spawner: S, options: SchedulerOptions) -> Self {
        Self::with_registry(Arc::new(ActivityRegistry::new()), store, spawner, options)
    }

    /// Create a scheduler around an existing registry.
    pub fn with_registry(
        registry: Arc<ActivityRegistry>,
        store: Arc<dyn TaskStore>,
        spawner: S,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            registry,
            store,
            clock: Arc::new(SystemClock),
            spawner,
            options,
            audit: None,
            busy: AtomicBool::new(false),
            recovery_settled: futures::lock::Mutex::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(parking_lot::Mutex::new(audit)));
        self
    }

    /// Activity registry.
    pub const fn registry(&self) -> &Arc<ActivityRegistry> {
        &self.registry
    }

    /// Store handle.
    pub const fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Tunables.
    pub const fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Register an activity; refused once the loop started.
    pub fn register(&self, activity: Activity) -> Result<(), SchedulerError> {
        self.registry.register(activity).map(|_| ())
    }

    fn runner(&self) -> TaskRunner<S> {
        TaskRunner::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.spawner.clone(),
            self.audit.clone(),
        )
    }

    fn admission(&self) -> AdmissionEngine {
        AdmissionEngine::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.options.task_limit,
        )
    }

    /// Submit a task. Priority and retry bound are copied from the activity.
    pub async fn create_task(&self, request: NewTaskRequest) -> Result<TaskRecord, SchedulerError> {
        let activity = self.registry.require(&request.activity_code)?;
        let task = self
            .store
            .create_task(
                NewTask {
                    activity_code: request.activity_code,
                    input: request.input,
                    priority: activity.priority(),
                    max_retry_times: activity.max_retry_times(),
                },
                self.clock.now_ms(),
            )
            .await?;
        tracing::debug!(task = %task.id, activity = %task.activity_code, "task created");
        record_audit(
            self.audit.as_ref(),
            build_audit_event(task.id.as_str(), &task.activity_code, AuditAction::Create, None),
        );
        Ok(task)
    }

    /// Fetch one task.
    pub async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, SchedulerError> {
        self.store.get_task(id).await
    }

    /// List tasks, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, SchedulerError> {
        self.store.list_tasks(filter).await
    }

    /// Reclassify tasks left RUNNING by a previous process.
    ///
    /// Runs at most once per scheduler, and never after this scheduler has
    /// admitted work: later calls return 0.
    pub async fn reset_task(&self) -> Result<usize, SchedulerError> {
        Ok(self.recover().await?.unwrap_or(0))
    }

    async fn recover(&self) -> Result<Option<usize>, SchedulerError> {
        let mut settled = self.recovery_settled.lock().await;
        if *settled {
            return Ok(None);
        }
        let reset = self.reset_orphans().await?;
        *settled = true;
        Ok(Some(reset))
    }

    // Once admission starts, RUNNING tasks may be our own; a later reset would
    // hand them out a second time.
    async fn settle_recovery_before_admission(&self) {
        let mut settled = self.recovery_settled.lock().await;
        if !*settled {
            tracing::debug!("admitting before recovery, orphan reset disabled");
            *settled = true;
        }
    }

    async fn reset_orphans(&self) -> Result<usize, SchedulerError> {
        let retryable = self.registry.retryable_codes();
        let reset = self.store.reset_tasks(&retryable, self.clock.now_ms()).await?;
        if reset > 0 {
            tracing::info!(reset, backend = self.store.backend(), "reset orphaned running tasks");
            record_audit(
                self.audit.as_ref(),
                build_audit_event("batch", "*", AuditAction::Reset, Some(reset.to_string())),
            );
        }
        Ok(reset)
    }

    /// Purge FINISHED tasks past the retention horizon.
    pub async fn expired_task(&self) -> Result<usize, SchedulerError> {
        let horizon = u64::try_from(self.options.retention.as_millis()).unwrap_or(u64::MAX);
        let before = self.clock.now_ms().saturating_sub(horizon);
        let expired = self.store.expire_tasks(before).await?;
        if expired > 0 {
            tracing::info!(expired, "purged finished tasks");
            record_audit(
                self.audit.as_ref(),
                build_audit_event("batch", "*", AuditAction::Expire, Some(expired.to_string())),
            );
        }
        Ok(expired)
    }

    async fn run_pool(&self, mode: ActivityMode) -> Result<DispatchReport, SchedulerError> {
        let runnable = self.admission().admit(mode).await?;
        if runnable.is_empty() {
            return Ok(DispatchReport::default());
        }
        Ok(self.runner().dispatch_all(runnable).await)
    }

    /// One admission and dispatch pass over every pool. Processing continues
    /// after this returns.
    pub async fn process(&self) -> Result<DispatchReport, SchedulerError> {
        self.settle_recovery_before_admission().await;
        let (parallel, sequence, batch) = futures::join!(
            self.run_pool(ActivityMode::Parallel),
            self.run_pool(ActivityMode::Sequence),
            self.run_pool(ActivityMode::Batch),
        );

        let mut report = DispatchReport::default();
        let mut first_error = None;
        for (mode, outcome) in [
            (ActivityMode::Parallel, parallel),
            (ActivityMode::Sequence, sequence),
            (ActivityMode::Batch, batch),
        ] {
            match outcome {
                Ok(pool) => report.merge(pool),
                Err(e) => {
                    tracing::warn!(pool = %mode, error = %e, "admission failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        tracing::debug!(
            started = report.started.len(),
            stale = report.stale.len(),
            "dispatch pass done"
        );
        Ok(report)
    }

    /// Like [`Self::process`], then wait for every started task to settle.
    pub async fn process_and_wait(&self) -> Result<Vec<TaskRecord>, SchedulerError> {
        let report = self.process().await?;
        let settled = futures::future::join_all(report.completions.into_iter().map(|c| c.wait())).await;
        Ok(settled.into_iter().flatten().collect())
    }

    async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let mut cycle = CycleReport::default();
        cycle.reset = self.recover().await?;
        cycle.expired = self.expired_task().await?;
        cycle.dispatch = self.process().await?;
        Ok(cycle)
    }

    /// One timer firing: recovery once, retention, then dispatch. Overlapping
    /// firings are no-ops.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous cycle still running, skipping tick");
            return TickOutcome::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        match self.run_cycle().await {
            Ok(cycle) => TickOutcome::Ran(cycle),
            Err(e) => {
                tracing::error!(error = %e, "scheduler cycle failed");
                TickOutcome::Failed(e)
            }
        }
    }

    /// Whether a cycle is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the timer loop was started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Counts per status plus configuration.
    pub async fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        Ok(SchedulerStats {
            counts: self.store.status_counts().await?,
            activities: self.registry.len(),
            task_limit: self.options.task_limit,
            started: self.is_started(),
        })
    }

    /// Close the registry and mark the scheduler started.
    fn mark_started(&self) -> Result<(), SchedulerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.registry.close();
        Ok(())
    }
}

#[cfg(feature = "tokio-runtime")]
pub use self::timer::SchedulerHandle;

#[cfg(feature = "tokio-runtime")]
mod timer {
    use std::sync::Arc;

    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::MissedTickBehavior;

    use super::{Scheduler, Spawn};
    use crate::core::SchedulerError;

    /// Handle of a running timer loop.
    pub struct SchedulerHandle {
        shutdown: watch::Sender<bool>,
        join: JoinHandle<()>,
    }

    impl SchedulerHandle {
        /// Stop firing new cycles and wait for the timer task to exit.
        /// Cycles and processing already in flight keep running.
        pub async fn shutdown(self) {
            let _ = self.shutdown.send(true);
            if let Err(e) = self.join.await {
                tracing::error!(error = %e, "scheduler timer task ended abnormally");
            }
        }
    }

    impl<S> Scheduler<S>
    where
        S: Spawn + Clone + Send + Sync + 'static,
    {
        /// Close the registry and fire [`Scheduler::tick`] every
        /// `cycle_interval` on the current tokio runtime.
        pub fn start(self: &Arc<Self>) -> Result<SchedulerHandle, SchedulerError> {
            self.mark_started()?;
            let (shutdown, mut shutdown_rx) = watch::channel(false);
            let scheduler = Arc::clone(self);
            let period = scheduler.options.cycle_interval;

            let join = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tracing::info!(
                    interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                    task_limit = scheduler.options.task_limit,
                    backend = scheduler.store.backend(),
                    "scheduler started"
                );
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let scheduler = Arc::clone(&scheduler);
                            tokio::spawn(async move {
                                scheduler.tick().await;
                            });
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::info!("scheduler stopped");
            });

            Ok(SchedulerHandle { shutdown, join })
        }
    }
}
