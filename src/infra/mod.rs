//! Infrastructure adapters: task store backends.

pub mod store;

pub use store::FileTaskStore;
pub use store::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use store::SqliteTaskStore;
