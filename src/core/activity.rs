//! Activity definitions and the activity registry.
//!
//! An activity is a named kind of work: a process function plus the
//! concurrency mode and retry policy every task of that activity inherits.
//! Activities are immutable once built; the registry hands out shared
//! references and stops accepting new definitions once scheduling starts.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::{ProcessError, TaskRecord};
use crate::core::SchedulerError;
use crate::util::serde::Priority;

/// Concurrency mode of an activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityMode {
    /// Tasks share one bounded pool.
    #[default]
    Parallel,
    /// At most one in-flight task per activity code.
    Sequence,
    /// Independent pool with the same rules as `Sequence`.
    Batch,
}

impl ActivityMode {
    /// Every mode, in admission order.
    pub const ALL: [Self; 3] = [Self::Parallel, Self::Sequence, Self::Batch];

    /// Stable name used in logs and audit events.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parallel => "PARALLEL",
            Self::Sequence => "SEQUENCE",
            Self::Batch => "BATCH",
        }
    }
}

impl fmt::Display for ActivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling policy of an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySettings {
    /// Concurrency mode.
    #[serde(default)]
    pub mode: ActivityMode,
    /// Whether failures may be retried at all.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Priority among idle tasks of the same pool.
    #[serde(default)]
    pub priority: Priority,
    /// Upper bound of failures; unlimited when unset.
    #[serde(default)]
    pub max_retry_times: Option<u32>,
}

const fn default_retryable() -> bool {
    true
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            mode: ActivityMode::Parallel,
            retryable: true,
            priority: Priority::LOWEST,
            max_retry_times: None,
        }
    }
}

impl ActivitySettings {
    /// Check the invariants that do not depend on the process function.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self.max_retry_times {
            Some(_) if !self.retryable => Err(SchedulerError::InvalidSetting(
                "max_retry_times requires retryable = true".into(),
            )),
            Some(0) => Err(SchedulerError::InvalidSetting(
                "max_retry_times must be greater than 0".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// The work function of an activity.
///
/// Returning [`ProcessError::retryable`] asks for another attempt; every other
/// error is terminal.
#[async_trait]
pub trait ActivityProcess: Send + Sync + 'static {
    /// Process one task and produce its result.
    async fn process(&self, task: TaskRecord) -> Result<Value, ProcessError>;
}

/// Adapter turning an async closure into an [`ActivityProcess`].
pub struct ProcessFn<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityProcess for ProcessFn<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
{
    async fn process(&self, task: TaskRecord) -> Result<Value, ProcessError> {
        (self.0)(task).await
    }
}

/// Wrap an async closure as a shareable process function.
pub fn process_fn<F, Fut>(f: F) -> Arc<dyn ActivityProcess>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
{
    Arc::new(ProcessFn(f))
}

/// An immutable, registered kind of work.
#[derive(Clone)]
pub struct Activity {
    code: String,
    settings: ActivitySettings,
    process: Arc<dyn ActivityProcess>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("code", &self.code)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Activity {
    /// Start building an activity.
    pub fn builder(code: impl Into<String>) -> ActivityBuilder {
        ActivityBuilder {
            code: code.into(),
            settings: ActivitySettings::default(),
            priority: 0,
            process: None,
        }
    }

    /// Unique code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Scheduling policy.
    pub const fn settings(&self) -> &ActivitySettings {
        &self.settings
    }

    /// Concurrency mode.
    pub const fn mode(&self) -> ActivityMode {
        self.settings.mode
    }

    /// Whether failures may be retried.
    pub const fn retryable(&self) -> bool {
        self.settings.retryable
    }

    /// Idle-task priority.
    pub const fn priority(&self) -> Priority {
        self.settings.priority
    }

    /// Failure bound.
    pub const fn max_retry_times(&self) -> Option<u32> {
        self.settings.max_retry_times
    }

    /// Shared process function.
    pub fn process(&self) -> Arc<dyn ActivityProcess> {
        Arc::clone(&self.process)
    }
}

/// Builder validating an [`Activity`] before it exists.
pub struct ActivityBuilder {
    code: String,
    settings: ActivitySettings,
    priority: u8,
    process: Option<Arc<dyn ActivityProcess>>,
}

impl ActivityBuilder {
    /// Set the concurrency mode.
    #[must_use]
    pub fn mode(mut self, mode: ActivityMode) -> Self {
        self.settings.mode = mode;
        self
    }

    /// Allow or forbid retries.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.settings.retryable = retryable;
        self
    }

    /// Set the priority; values above 9 are rejected by [`Self::build`].
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Bound the number of failures.
    #[must_use]
    pub fn max_retry_times(mut self, max: u32) -> Self {
        self.settings.max_retry_times = Some(max);
        self
    }

    /// Replace all settings at once.
    #[must_use]
    pub fn settings(mut self, settings: ActivitySettings) -> Self {
        self.priority = settings.priority.value();
        self.settings = settings;
        self
    }

    /// Attach the process function.
    #[must_use]
    pub fn process(mut self, process: Arc<dyn ActivityProcess>) -> Self {
        self.process = Some(process);
        self
    }

    /// Attach an async closure as the process function.
    #[must_use]
    pub fn process_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
    {
        self.process(process_fn(f))
    }

    /// Validate and freeze the activity.
    pub fn build(self) -> Result<Activity, SchedulerError> {
        if self.code.trim().is_empty() {
            return Err(SchedulerError::InvalidSetting(
                "activity code must not be empty".into(),
            ));
        }
        let mut settings = self.settings;
        settings.priority = Priority::new(self.priority).ok_or_else(|| {
            SchedulerError::InvalidSetting(format!(
                "activity `{}`: priority {} outside 0..=9",
                self.code, self.priority
            ))
        })?;
        settings
            .validate()
            .map_err(|e| SchedulerError::InvalidSetting(format!("activity `{}`: {e}", self.code)))?;
        let process = self.process.ok_or_else(|| {
            SchedulerError::InvalidSetting(format!("activity `{}`: process is required", self.code))
        })?;
        Ok(Activity {
            code: self.code,
            settings,
            process,
        })
    }
}

/// Registry of activities owned by one scheduler.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: RwLock<BTreeMap<String, Arc<Activity>>>,
    closed: AtomicBool,
}

impl ActivityRegistry {
    /// Create an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity.
    pub fn register(&self, activity: Activity) -> Result<Arc<Activity>, SchedulerError> {
        activity.settings.validate()?;
        let mut activities = self.activities.write();
        // Checked under the write lock; `close` takes it too.
        if self.is_closed() {
            return Err(SchedulerError::RegistryClosed);
        }
        if activities.contains_key(&activity.code) {
            return Err(SchedulerError::DuplicateActivity(activity.code));
        }
        let activity = Arc::new(activity);
        activities.insert(activity.code.clone(), Arc::clone(&activity));
        tracing::debug!(
            code = %activity.code,
            mode = %activity.mode(),
            "activity registered"
        );
        Ok(activity)
    }

    /// Look up an activity.
    pub fn get(&self, code: &str) -> Option<Arc<Activity>> {
        self.activities.read().get(code).cloned()
    }

    /// Look up an activity or fail with `ActivityNotFound`.
    pub fn require(&self, code: &str) -> Result<Arc<Activity>, SchedulerError> {
        self.get(code)
            .ok_or_else(|| SchedulerError::ActivityNotFound(code.to_string()))
    }

    /// Activities of one mode, ordered by code.
    pub fn by_mode(&self, mode: ActivityMode) -> Vec<Arc<Activity>> {
        self.activities
            .read()
            .values()
            .filter(|a| a.mode() == mode)
            .cloned()
            .collect()
    }

    /// Codes of one mode, ordered.
    pub fn codes_by_mode(&self, mode: ActivityMode) -> Vec<String> {
        self.by_mode(mode).iter().map(|a| a.code.clone()).collect()
    }

    /// Codes of every retryable activity.
    pub fn retryable_codes(&self) -> Vec<String> {
        self.activities
            .read()
            .values()
            .filter(|a| a.retryable())
            .map(|a| a.code.clone())
            .collect()
    }

    /// All registered activities, ordered by code.
    pub fn all(&self) -> Vec<Arc<Activity>> {
        self.activities.read().values().cloned().collect()
    }

    /// Number of registered activities.
    pub fn len(&self) -> usize {
        self.activities.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.activities.read().is_empty()
    }

    /// Stop accepting registrations.
    pub fn close(&self) {
        let _activities = self.activities.write();
        self.closed.store(true, Ordering::Release);
    }

    /// Whether registrations are refused.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_activity(code: &str) -> ActivityBuilder {
        Activity::builder(code).process_fn(|task| async move { Ok(task.input) })
    }

    #[test]
    fn rejects_retry_bound_without_retryable() {
        let err = ok_activity("A")
            .retryable(false)
            .max_retry_times(3)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSetting(_)));
    }

    #[test]
    fn rejects_priority_out_of_range_and_missing_process() {
        assert!(matches!(
            ok_activity("A").priority(10).build(),
            Err(SchedulerError::InvalidSetting(_))
        ));
        assert!(matches!(
            Activity::builder("A").build(),
            Err(SchedulerError::InvalidSetting(_))
        ));
    }

    #[test]
    fn duplicate_and_closed_registry() {
        let registry = ActivityRegistry::new();
        registry.register(ok_activity("A").build().unwrap()).unwrap();
        assert!(matches!(
            registry.register(ok_activity("A").build().unwrap()),
            Err(SchedulerError::DuplicateActivity(code)) if code == "A"
        ));
        registry.close();
        assert!(matches!(
            registry.register(ok_activity("B").build().unwrap()),
            Err(SchedulerError::RegistryClosed)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn nothing_lands_after_close_under_contention() {
        let registry = Arc::new(ActivityRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0.. {
                        let activity = ok_activity(&format!("w{w}-{i}")).build().unwrap();
                        if registry.register(activity).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.close();
        let at_close = registry.len();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(registry.len(), at_close);
    }

    #[test]
    fn lookups_by_mode() {
        let registry = ActivityRegistry::new();
        registry
            .register(ok_activity("P").priority(9).build().unwrap())
            .unwrap();
        registry
            .register(
                ok_activity("S")
                    .mode(ActivityMode::Sequence)
                    .retryable(false)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(ok_activity("B").mode(ActivityMode::Batch).build().unwrap())
            .unwrap();

        assert_eq!(registry.codes_by_mode(ActivityMode::Parallel), vec!["P"]);
        assert_eq!(registry.codes_by_mode(ActivityMode::Sequence), vec!["S"]);
        assert_eq!(registry.codes_by_mode(ActivityMode::Batch), vec!["B"]);
        assert_eq!(registry.retryable_codes(), vec!["B", "P"]);
        assert_eq!(registry.require("P").unwrap().priority().value(), 9);
        assert!(matches!(
            registry.require("X"),
            Err(SchedulerError::ActivityNotFound(_))
        ));
    }
}
