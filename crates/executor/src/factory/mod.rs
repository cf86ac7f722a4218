//! 作业图构建器
//!
//! 每种DDL操作对应一个工厂：输入是已经过校验的准备数据，输出是一张
//! 结构合法的作业图。工厂只决定拓扑，不决定机制；任务如何执行由
//! 调度器和任务处理器负责。

use std::collections::BTreeSet;

use ddl_core::{DdlResult, ExecutorConfig};
use ddl_domain::{DdlRequest, JobGraph};

pub mod bring_up;
pub mod create_index;
pub mod merge_partition;
pub mod move_partition;
pub mod reorg_table_group;
pub mod split_partition;

pub use create_index::CreateGlobalIndexJobFactory;
pub use merge_partition::MergePartitionJobFactory;
pub use move_partition::MovePartitionJobFactory;
pub use reorg_table_group::ReorgTableGroupJobFactory;
pub use split_partition::SplitPartitionJobFactory;

/// 工厂模板：校验输入、生成拓扑、并入排除资源、整图校验
pub trait JobFactory {
    /// 输入合法性检查，失败时作业不会被创建
    fn validate(&self) -> DdlResult<()>;

    /// 生成作业图拓扑
    fn do_create(&self) -> DdlResult<JobGraph>;

    /// 本作业运行期间需要独占的资源
    fn excluded_resources(&self) -> BTreeSet<String>;

    fn create(&self) -> DdlResult<JobGraph> {
        self.validate()?;
        let mut graph = self.do_create()?;
        graph
            .excluded_resources
            .extend(self.excluded_resources());
        graph.validate()?;
        Ok(graph)
    }
}

/// 按请求种类构建作业图
pub fn build_job(request: &DdlRequest, config: &ExecutorConfig) -> DdlResult<JobGraph> {
    match request {
        DdlRequest::SplitPartition(prepared) => {
            SplitPartitionJobFactory::new(prepared.clone(), config).create()
        }
        DdlRequest::MergePartition(prepared) => {
            MergePartitionJobFactory::new(prepared.clone(), config).create()
        }
        DdlRequest::MovePartition(prepared) => {
            MovePartitionJobFactory::new(prepared.clone(), config).create()
        }
        DdlRequest::CreateGlobalIndex(prepared) => {
            CreateGlobalIndexJobFactory::new(prepared.clone(), config).create()
        }
        DdlRequest::ReorgTableGroup(prepared) => {
            ReorgTableGroupJobFactory::new(prepared.clone(), config).create()
        }
    }
}

/// 资源命名约定：同名对象在不同schema下互不冲突
pub fn table_group_resource(schema_name: &str, table_group: &str) -> String {
    format!("{schema_name}.tablegroup.{table_group}")
}

pub fn table_resource(schema_name: &str, table_name: &str) -> String {
    format!("{schema_name}.table.{table_name}")
}

pub fn partition_resource(schema_name: &str, table_name: &str, partition: &str) -> String {
    format!("{schema_name}.table.{table_name}.partition.{partition}")
}
