pub mod commands;
pub mod graph;
pub mod ports;
pub mod prepared;
pub mod task;

pub use commands::{OperatorAction, OperatorCommand};
pub use graph::{CombinedSubGraph, JobGraph, JobState};
pub use ports::{ChangeLogSink, JobRepository, MetaStore, MetaTransaction, MetaWrite, PhysicalDdlExecutor};
pub use prepared::{
    CreateGlobalIndexPreparedData, DdlRequest, MergePartitionPreparedData,
    MovePartitionPreparedData, ReorgTableGroupPreparedData, SplitPartitionPreparedData,
    TargetGroupPlacement,
};
pub use task::{
    AddMetaSpec, BackfillSpec, DdlTask, DropPhysicalTablesSpec, PartitionGroupSpec,
    PhysicalDdlSpec, SubJobSpec, SyncNotifySpec, TableVisibility, TaskPayload, TaskState,
    UpdateVisibilitySpec, ValidateSpec,
};

pub use ddl_core::{DdlEngineError, DdlResult};
