//! Queue persistence backends.

pub mod libsql;
pub mod memory;
pub mod traits;

pub use libsql::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::QueueStore;
