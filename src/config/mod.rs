//! Configuration models for the scheduler, store backends and activities.

pub mod scheduler;

pub use scheduler::{ActivityConfig, SchedulerConfig, StoreBackendConfig};
