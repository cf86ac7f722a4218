//! 测试共享的假协作方与数据构造器

pub mod builders;
pub mod fakes;

pub use builders::{linear_graph, split_prepared};
pub use fakes::{CountingPhysicalExecutor, RecordingChangeLogSink};
