//! 引擎对外协作方的端口定义
//!
//! 所有端口都是显式注入的 `Arc<dyn T>`，不依赖任何全局单例：
//! - `JobRepository` - 作业/任务状态的唯一事实来源
//! - `MetaStore` - 作业所属schema的持久化元数据（带事务边界）
//! - `PhysicalDdlExecutor` - 面向单个物理分片的DDL执行能力
//! - `ChangeLogSink` - 变更通知（fire-and-forget）

use std::collections::BTreeMap;

use async_trait::async_trait;

use ddl_core::DdlResult;

use crate::commands::{OperatorAction, OperatorCommand};
use crate::graph::{JobGraph, JobState};
use crate::task::{AddMetaSpec, BackfillSpec, DdlTask, TableVisibility};

/// 作业仓储接口
///
/// 作业图在第一个任务执行前整体落盘，此后按任务粒度更新状态，
/// 崩溃后通过 `load_active_jobs` 恢复。
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 持久化一张新作业图并分配作业ID（写回 `graph.job_id` 及各任务的 `job_id`）
    async fn create_job(&self, graph: &mut JobGraph) -> DdlResult<i64>;

    /// 更新作业状态与错误信息
    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()>;

    /// 更新单个任务的状态与备注
    async fn update_task(&self, task: &DdlTask) -> DdlResult<()>;

    async fn get_job(&self, job_id: i64) -> DdlResult<Option<JobGraph>>;

    /// 加载所有未达终态的作业（崩溃恢复用）
    async fn load_active_jobs(&self) -> DdlResult<Vec<JobGraph>>;

    /// 追加一条操作员指令，返回指令ID
    async fn append_command(
        &self,
        job_id: i64,
        action: OperatorAction,
        requester: &str,
    ) -> DdlResult<i64>;

    /// 取走并消费指定作业的全部未消费指令
    async fn take_pending_commands(&self, job_id: i64) -> DdlResult<Vec<OperatorCommand>>;
}

/// 元数据写操作，在一个事务内原子生效
#[derive(Debug, Clone, PartialEq)]
pub enum MetaWrite {
    AddMeta(AddMetaSpec),
    RemoveMeta(AddMetaSpec),
    SetVisibility {
        object_name: String,
        target: TableVisibility,
    },
}

/// 一次元数据事务：全部写入要么随 `commit` 生效，要么随 `abort` 丢弃
#[async_trait]
pub trait MetaTransaction: Send {
    async fn apply(&mut self, schema_name: &str, write: &MetaWrite) -> DdlResult<()>;
    async fn commit(self: Box<Self>) -> DdlResult<()>;
    async fn abort(self: Box<Self>) -> DdlResult<()>;
}

/// 作业所属schema的持久化元数据存储
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn begin(&self) -> DdlResult<Box<dyn MetaTransaction>>;

    /// 表组各成员表的版本；表组不存在时返回None
    async fn tables_version(
        &self,
        schema_name: &str,
        table_group: &str,
    ) -> DdlResult<Option<BTreeMap<String, i64>>>;

    /// 表组成员表数量；表组不存在时返回None
    async fn table_group_member_count(
        &self,
        schema_name: &str,
        table_group: &str,
    ) -> DdlResult<Option<usize>>;

    async fn physical_group_exists(&self, schema_name: &str, group: &str) -> DdlResult<bool>;

    /// 对象当前可见性（测试与校验用）
    async fn visibility(
        &self,
        schema_name: &str,
        object_name: &str,
    ) -> DdlResult<Option<TableVisibility>>;
}

/// 面向单个物理分片的执行能力
///
/// 传输方式由实现决定；调用方假定语句幂等或由实现自行重试。
#[async_trait]
pub trait PhysicalDdlExecutor: Send + Sync {
    /// 在指定物理分组的一张物理表上执行语句
    async fn execute_statement(
        &self,
        schema_name: &str,
        phy_group: &str,
        phy_table: &str,
        statement: &str,
    ) -> DdlResult<()>;

    /// 把旧分区数据回填进新拓扑，返回迁移行数
    async fn copy_rows(&self, schema_name: &str, spec: &BackfillSpec) -> DdlResult<u64>;

    /// 清除已回填到目标分区的数据（回填的补偿动作）
    async fn purge_rows(
        &self,
        schema_name: &str,
        table_name: &str,
        target_partitions: &[String],
    ) -> DdlResult<u64>;
}

/// 变更通知接收方（如复制日志标记）
#[async_trait]
pub trait ChangeLogSink: Send + Sync {
    async fn mark_ddl(&self, schema_name: &str, object_name: &str, mark: &str) -> DdlResult<()>;
}
