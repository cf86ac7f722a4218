pub mod admission;
pub mod context;
pub mod dag_executor;
pub mod engine;
pub mod factory;
pub mod handler;
pub mod recovery;
pub mod retry;
pub mod subjob;

pub use admission::AdmissionGate;
pub use context::EngineContext;
pub use dag_executor::DagExecutor;
pub use engine::{DdlEngine, JobOutcome};
pub use handler::{JobScope, TaskHandler, TaskOutcome};
pub use recovery::{RecoveryConfig, RecoveryReport, StartupRecoveryService};
