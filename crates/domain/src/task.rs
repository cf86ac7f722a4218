use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prepared::DdlRequest;

/// 任务状态机
///
/// `Created → Ready → Running → {Success | Failed}`；作业回滚时，
/// 成功的任务经历 `RollingBack → {RolledBack | RollbackFailed}`。
/// `RollbackFailed` 是致命状态，作业会被冻结等待人工介入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ROLLING_BACK")]
    RollingBack,
    #[serde(rename = "ROLLED_BACK")]
    RolledBack,
    #[serde(rename = "ROLLBACK_FAILED")]
    RollbackFailed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::RollingBack => "ROLLING_BACK",
            TaskState::RolledBack => "ROLLED_BACK",
            TaskState::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(TaskState::Created),
            "READY" => Some(TaskState::Ready),
            "RUNNING" => Some(TaskState::Running),
            "SUCCESS" => Some(TaskState::Success),
            "FAILED" => Some(TaskState::Failed),
            "ROLLING_BACK" => Some(TaskState::RollingBack),
            "ROLLED_BACK" => Some(TaskState::RolledBack),
            "ROLLBACK_FAILED" => Some(TaskState::RollbackFailed),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        TaskState::parse(s).ok_or_else(|| format!("Invalid task state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 表/索引在变更过程中的可见性阶梯
///
/// 新拓扑从对外不可见开始，经过只删/只写阶段逐级放开，最终 `Public`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableVisibility {
    #[serde(rename = "ABSENT")]
    Absent,
    #[serde(rename = "DOING_REORG")]
    DoingReorg,
    #[serde(rename = "DELETE_ONLY")]
    DeleteOnly,
    #[serde(rename = "WRITE_ONLY")]
    WriteOnly,
    #[serde(rename = "READY_TO_PUBLIC")]
    ReadyToPublic,
    #[serde(rename = "PUBLIC")]
    Public,
}

impl TableVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableVisibility::Absent => "ABSENT",
            TableVisibility::DoingReorg => "DOING_REORG",
            TableVisibility::DeleteOnly => "DELETE_ONLY",
            TableVisibility::WriteOnly => "WRITE_ONLY",
            TableVisibility::ReadyToPublic => "READY_TO_PUBLIC",
            TableVisibility::Public => "PUBLIC",
        }
    }
}

/// 校验类任务的检查项
///
/// 校验任务没有持久副作用，只在指定前置条件不满足时抛出类型化失败，
/// 总是被构建为低扇入的早期节点。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check")]
pub enum ValidateSpec {
    /// 表组存在且各成员表版本与准备阶段一致（无版本偏斜）
    TableGroupVersion {
        table_group: String,
        tables_version: BTreeMap<String, i64>,
    },
    /// 表组为空（没有任何成员表）
    TableGroupEmpty { table_group: String },
    /// 目标物理分组全部可用
    PhysicalGroupsAvailable { groups: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionGroupSpec {
    /// 分区名
    pub name: String,
    /// 承载该分区的物理库
    pub phy_db: String,
}

/// 元数据登记任务的参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "meta")]
pub enum AddMetaSpec {
    /// 登记一次分区重组：待淘汰的旧分区 + 尚不可见的新分区组
    PartitionReorg {
        table_group: String,
        outdated_partitions: Vec<String>,
        invisible_partition_groups: Vec<PartitionGroupSpec>,
    },
    /// 登记一个全局索引
    GlobalIndex {
        table_name: String,
        index_name: String,
        columns: Vec<String>,
    },
}

impl AddMetaSpec {
    /// 元数据登记所针对的对象名（表组或索引）
    pub fn object_name(&self) -> &str {
        match self {
            AddMetaSpec::PartitionReorg { table_group, .. } => table_group,
            AddMetaSpec::GlobalIndex { index_name, .. } => index_name,
        }
    }
}

/// 物理DDL任务参数
///
/// `statement` 中的 `{table}` 占位符会按拓扑中的每张物理表展开执行。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhysicalDdlSpec {
    /// 物理分组 -> 物理表列表
    pub topology: BTreeMap<String, Vec<String>>,
    pub statement: String,
    /// 补偿语句；为None时该任务不可回滚
    pub compensating_statement: Option<String>,
    /// 幂等语句（如 IF NOT EXISTS）在崩溃恢复后可以安全重放
    pub idempotent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillSpec {
    pub table_name: String,
    pub source_partitions: Vec<String>,
    pub target_partitions: Vec<String>,
    pub batch_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateVisibilitySpec {
    /// 可见性所属对象（表组或索引名）
    pub object_name: String,
    pub target: TableVisibility,
    /// 回滚时恢复到的前一阶段
    pub previous: TableVisibility,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DropPhysicalTablesSpec {
    /// 物理分组 -> 待清理的物理表
    pub topology: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncNotifySpec {
    pub object_name: String,
    pub mark: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubJobSpec {
    pub request: DdlRequest,
    /// true 表示子作业完全依赖父作业已持有的排除资源，不得额外申请；
    /// false 表示允许子作业申请父作业未持有的资源（按常规准入检查）
    pub parent_acquire_resource: bool,
}

/// 任务载荷：以标签化联合体表达所有任务种类
///
/// 持久化为带 `kind` 标签的JSON，反序列化即可还原出对应变体，
/// 不依赖任何运行时类型发现。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum TaskPayload {
    /// 空任务，用作子图拼接的锚点
    Empty,
    Validate(ValidateSpec),
    AddMeta(AddMetaSpec),
    PhysicalDdl(PhysicalDdlSpec),
    Backfill(BackfillSpec),
    UpdateVisibility(UpdateVisibilitySpec),
    DropPhysicalTables(DropPhysicalTablesSpec),
    SyncNotify(SyncNotifySpec),
    /// 检查点：调度器在此节点暂停，等待操作员显式恢复
    Pause,
    SubJob(SubJobSpec),
}

/// 一次原子的、重试幂等的工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlTask {
    /// 任务ID，在进入作业图时才会分配
    pub id: i64,
    pub job_id: i64,
    pub schema_name: String,
    pub state: TaskState,
    pub payload: TaskPayload,
    /// 失败原因或操作备注
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DdlTask {
    pub fn new(schema_name: impl Into<String>, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 进入作业图时分配
            job_id: 0,
            schema_name: schema_name.into(),
            state: TaskState::Created,
            payload,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.payload {
            TaskPayload::Empty => "Empty",
            TaskPayload::Validate(_) => "Validate",
            TaskPayload::AddMeta(_) => "AddMeta",
            TaskPayload::PhysicalDdl(_) => "PhysicalDdl",
            TaskPayload::Backfill(_) => "Backfill",
            TaskPayload::UpdateVisibility(_) => "UpdateVisibility",
            TaskPayload::DropPhysicalTables(_) => "DropPhysicalTables",
            TaskPayload::SyncNotify(_) => "SyncNotify",
            TaskPayload::Pause => "Pause",
            TaskPayload::SubJob(_) => "SubJob",
        }
    }

    /// 诊断备注
    pub fn remark(&self) -> String {
        match &self.payload {
            TaskPayload::Empty => String::new(),
            TaskPayload::Validate(ValidateSpec::TableGroupVersion { table_group, .. }) => {
                format!("|tableGroup: {table_group}")
            }
            TaskPayload::Validate(ValidateSpec::TableGroupEmpty { table_group }) => {
                format!("|tableGroup: {table_group}")
            }
            TaskPayload::Validate(ValidateSpec::PhysicalGroupsAvailable { groups }) => {
                format!("|physicalGroups: {groups:?}")
            }
            TaskPayload::AddMeta(spec) => format!("|object: {}", spec.object_name()),
            TaskPayload::PhysicalDdl(spec) => format!("|statement: {}", spec.statement),
            TaskPayload::Backfill(spec) => format!(
                "|table: {}, sourcePartitions: {:?}, targetPartitions: {:?}",
                spec.table_name, spec.source_partitions, spec.target_partitions
            ),
            TaskPayload::UpdateVisibility(spec) => format!(
                "|object: {}, {} -> {}",
                spec.object_name,
                spec.previous.as_str(),
                spec.target.as_str()
            ),
            TaskPayload::DropPhysicalTables(spec) => {
                format!("|physicalTables: {}", spec.topology.values().flatten().count())
            }
            TaskPayload::SyncNotify(spec) => {
                format!("|object: {}, mark: {}", spec.object_name, spec.mark)
            }
            TaskPayload::Pause => String::new(),
            TaskPayload::SubJob(spec) => format!("|subJob: {}", spec.request.description()),
        }
    }

    /// 该任务成功后能否被补偿回滚
    pub fn is_rollbackable(&self) -> bool {
        match &self.payload {
            TaskPayload::Empty
            | TaskPayload::Validate(_)
            | TaskPayload::AddMeta(_)
            | TaskPayload::Backfill(_)
            | TaskPayload::UpdateVisibility(_)
            | TaskPayload::SyncNotify(_)
            | TaskPayload::Pause => true,
            TaskPayload::PhysicalDdl(spec) => spec.compensating_statement.is_some(),
            // 物理表一旦删除无法恢复；已发布的子作业需要完整的逆向DDL才能撤销
            TaskPayload::DropPhysicalTables(_) | TaskPayload::SubJob(_) => false,
        }
    }

    /// 崩溃恢复时，处于RUNNING的任务是否可以直接重放
    pub fn is_idempotent(&self) -> bool {
        match &self.payload {
            TaskPayload::PhysicalDdl(spec) => spec.idempotent,
            _ => true,
        }
    }

    /// 超细粒度锁提示：该任务独占访问的资源
    pub fn exclusive_resource_hint(&self) -> Option<String> {
        match &self.payload {
            TaskPayload::Validate(ValidateSpec::TableGroupVersion { table_group, .. })
            | TaskPayload::Validate(ValidateSpec::TableGroupEmpty { table_group }) => {
                Some(table_group.clone())
            }
            TaskPayload::AddMeta(spec) => Some(spec.object_name().to_string()),
            TaskPayload::UpdateVisibility(spec) => Some(spec.object_name.clone()),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            TaskState::Success
                | TaskState::Failed
                | TaskState::RolledBack
                | TaskState::RollbackFailed
        )
    }

    pub fn mark(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (作业 {}, 种类 {}{})",
            self.id,
            self.job_id,
            self.kind(),
            self.remark()
        )
    }
}
