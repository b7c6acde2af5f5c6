//! Builder to construct a scheduler from configuration.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use crate::config::{SchedulerConfig, StoreBackendConfig};
use crate::core::{
    process_fn, Activity, ActivityProcess, AppResult, AuditSink, ProcessError, Scheduler,
    SchedulerError, Spawn, TaskRecord, TaskStore,
};
use crate::infra::store::{FileTaskStore, InMemoryTaskStore};
use crate::util::clock::Clock;

/// Open the task store selected by configuration.
pub fn build_store(cfg: &StoreBackendConfig) -> Result<Arc<dyn TaskStore>, SchedulerError> {
    let store: Arc<dyn TaskStore> = match cfg {
        StoreBackendConfig::InMemory => Arc::new(InMemoryTaskStore::new()),
        StoreBackendConfig::File { path } => Arc::new(FileTaskStore::open(path)?),
        #[cfg(feature = "sqlite")]
        StoreBackendConfig::Sqlite { path } => {
            Arc::new(crate::infra::store::SqliteTaskStore::open(path)?)
        }
        #[cfg(not(feature = "sqlite"))]
        StoreBackendConfig::Sqlite { .. } => {
            return Err(SchedulerError::InvalidSetting(
                "sqlite store requires the `sqlite` feature".into(),
            ));
        }
    };
    Ok(store)
}

/// Turns a [`SchedulerConfig`] plus process functions into a [`Scheduler`].
///
/// Every activity named in the configuration needs a process function; code
/// defined activities can be added with [`SchedulerBuilder::activity`].
pub struct SchedulerBuilder<S> {
    config: SchedulerConfig,
    spawner: S,
    processes: HashMap<String, Arc<dyn ActivityProcess>>,
    activities: Vec<Activity>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Box<dyn AuditSink>>,
}

impl<S> SchedulerBuilder<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Start from a configuration and a spawner.
    pub fn new(config: SchedulerConfig, spawner: S) -> Self {
        Self {
            config,
            spawner,
            processes: HashMap::new(),
            activities: Vec::new(),
            store: None,
            clock: None,
            audit: None,
        }
    }

    /// Attach the process function of a configured activity.
    #[must_use]
    pub fn process(mut self, code: impl Into<String>, process: Arc<dyn ActivityProcess>) -> Self {
        self.processes.insert(code.into(), process);
        self
    }

    /// Attach an async closure as the process function of a configured activity.
    #[must_use]
    pub fn process_fn<F, Fut>(self, code: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
    {
        self.process(code, process_fn(f))
    }

    /// Register a fully built activity in addition to the configured ones.
    #[must_use]
    pub fn activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    /// Use this store instead of the configured backend.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate everything and assemble the scheduler.
    pub fn build(mut self) -> AppResult<Scheduler<S>> {
        self.config
            .validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

        let store = match self.store.take() {
            Some(store) => store,
            None => build_store(&self.config.store).context("failed to open task store")?,
        };

        let mut scheduler = Scheduler::new(store, self.spawner, self.config.options());
        if let Some(clock) = self.clock {
            scheduler = scheduler.with_clock(clock);
        }
        if let Some(audit) = self.audit {
            scheduler = scheduler.with_audit(audit);
        }

        let configured: BTreeMap<_, _> = self.config.activities.into_iter().collect();
        for (code, settings) in configured {
            let process = self
                .processes
                .remove(&code)
                .ok_or_else(|| anyhow::anyhow!("activity `{code}` has no process function"))?;
            let activity = Activity::builder(code.clone())
                .settings(settings)
                .process(process)
                .build()
                .with_context(|| format!("activity `{code}`"))?;
            scheduler.register(activity)?;
        }
        if let Some(code) = self.processes.keys().next() {
            anyhow::bail!("process function given for unconfigured activity `{code}`");
        }
        for activity in self.activities {
            scheduler.register(activity)?;
        }

        tracing::info!(
            activities = scheduler.registry().len(),
            backend = scheduler.store().backend(),
            task_limit = scheduler.options().task_limit,
            "scheduler built"
        );
        Ok(scheduler)
    }
}
