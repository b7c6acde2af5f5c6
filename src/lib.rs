//! # Prometheus Task Lot
//!
//! A durable, activity-based task scheduler for the Prometheus AI platform.
//!
//! Work is described by **activities**: a named process function plus the
//! policy every task of that activity inherits (concurrency mode, priority,
//! retryability, retry bound). Callers submit **tasks** (an activity code and
//! an opaque JSON input); tasks are persisted in a [`core::TaskStore`] and a
//! periodic **cycle** admits runnable tasks, claims them with an optimistic
//! compare-and-swap and runs them detached.
//!
//! ## Key Features
//!
//! - **Three concurrency pools**: `PARALLEL` activities share one bounded pool,
//!   `SEQUENCE` and `BATCH` activities run at most one task per activity code.
//! - **Retry policy**: retryable failures return to the pool until the
//!   activity's retry bound is exhausted.
//! - **Crash recovery**: tasks left `RUNNING` by a dead process are
//!   reclassified on the first cycle.
//! - **Retention**: finished tasks are purged after a configurable horizon.
//! - **Pluggable persistence**: in-memory, JSON-lines file and SQLite stores;
//!   several scheduler processes may share one SQLite database.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_task_lot::core::{Activity, ActivityMode, NewTaskRequest, Scheduler, SchedulerOptions};
//! use prometheus_task_lot::infra::InMemoryTaskStore;
//! use prometheus_task_lot::runtime::TokioSpawner;
//!
//! let scheduler = Arc::new(Scheduler::new(
//!     Arc::new(InMemoryTaskStore::new()),
//!     TokioSpawner::current(),
//!     SchedulerOptions::default(),
//! ));
//! scheduler.register(
//!     Activity::builder("send-email")
//!         .mode(ActivityMode::Sequence)
//!         .max_retry_times(3)
//!         .process_fn(|task| async move { Ok(task.input) })
//!         .build()?,
//! )?;
//!
//! let handle = scheduler.start()?;
//! scheduler
//!     .create_task(NewTaskRequest::new("send-email", serde_json::json!({ "to": "ops" })))
//!     .await?;
//! // ...
//! handle.shutdown().await;
//! ```
//!
//! For complete flows, see `tests/scheduler_flow_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: activities, tasks, admission and the cycle loop.
pub mod core;
/// Configuration models for the scheduler, store backends and activities.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Infrastructure adapters: task store backends.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
