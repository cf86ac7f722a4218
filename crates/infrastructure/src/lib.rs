pub mod memory;
pub mod meta;
pub mod sqlite;

pub use memory::InMemoryJobRepository;
pub use meta::{InMemoryMetaStore, TracingChangeLogSink, TracingPhysicalExecutor};
pub use sqlite::SqliteJobRepository;
