//! Core scheduling abstractions: activities, tasks, admission and the cycle loop.

pub mod activity;
pub mod admission;
pub mod audit;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod task;

pub use activity::{
    process_fn, Activity, ActivityBuilder, ActivityMode, ActivityProcess, ActivityRegistry,
    ActivitySettings, ProcessFn,
};
pub use admission::{
    idle_order, remaining_slots, retry_order, select_parallel, select_parallel_from,
    select_sequence, select_sequence_from, AdmissionEngine,
};
pub use audit::{
    build_audit_event, record_audit, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink,
    SharedAuditSink, TracingAuditSink,
};
pub use error::{AppResult, SchedulerError};
pub use runner::{Completion, DispatchReport, Spawn, TaskRunner};
#[cfg(feature = "tokio-runtime")]
pub use scheduler::SchedulerHandle;
pub use scheduler::{
    CycleReport, Scheduler, SchedulerOptions, SchedulerStats, NewTaskRequest, TickOutcome,
    DEFAULT_CYCLE_INTERVAL, DEFAULT_RETENTION, DEFAULT_TASK_LIMIT,
};
pub use store::TaskStore;
pub use task::{
    failure_status, ErrorKind, ErrorSnapshot, NewTask, ProcessError, TaskFilter, TaskRecord,
    TaskStatus, RESET_MESSAGE,
};
