//! Task store backends.

pub mod file;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod table;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskStore;
