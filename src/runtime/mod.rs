//! Runtime adapters and the API surface.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use api::{
    health, snapshot, submit_task, task_status, ActivitySnapshot, Health, SchedulerSnapshot,
    TaskSubmission, TaskView,
};
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::TokioSpawner;

#[cfg(feature = "tokio-runtime")]
/// Scheduler running its tasks on tokio.
pub type TokioScheduler = crate::core::Scheduler<TokioSpawner>;
