pub mod config;
pub mod errors;

pub use config::{DatabaseConfig, EngineConfig, ExecutorConfig};
pub use errors::{DdlEngineError, DdlResult};
