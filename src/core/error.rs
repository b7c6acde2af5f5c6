//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::task::TaskStatus;
use crate::util::serde::TaskId;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No activity is registered under the code.
    #[error("activity not found: {0}")]
    ActivityNotFound(String),
    /// An activity with the same code is already registered.
    #[error("activity already registered: {0}")]
    DuplicateActivity(String),
    /// Activity or scheduler settings are inconsistent.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    /// The registry no longer accepts activities because scheduling started.
    #[error("activity registry closed")]
    RegistryClosed,
    /// The task version changed since it was read; another cycle claimed it.
    #[error("stale task {0}: updated since it was read")]
    StaleTask(TaskId),
    /// No task stored under the identifier.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// The store refused a write that would break the task state machine.
    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        /// Task being written.
        id: TaskId,
        /// Status currently stored.
        from: TaskStatus,
        /// Status the write asked for.
        to: TaskStatus,
    },
    /// The scheduler loop is already running.
    #[error("scheduler already started")]
    AlreadyStarted,
    /// Backend I/O failure with context.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// A payload or record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Wrap any displayable backend failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
