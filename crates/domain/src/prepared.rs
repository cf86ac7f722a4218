use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::{PartitionGroupSpec, TableVisibility};

/// 拆分后数据落到哪个表组
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "placement")]
pub enum TargetGroupPlacement {
    /// 留在原表组
    RemainInOriginalTableGroup,
    /// 迁移到已存在的表组
    MoveToExistingTableGroup {
        target_table_group: String,
        /// 目标表组内首批成员表的版本（用于并行校验）
        target_tables_version: BTreeMap<String, i64>,
    },
    /// 先建新表组再拆分（通过两个子作业完成）
    CreateNewTableGroup { new_table_group: String },
}

/// 分区拆分的准备数据
///
/// 由（不在本系统范围内的）DDL校验/准备层产出，构建器只负责拓扑。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitPartitionPreparedData {
    pub schema_name: String,
    pub table_name: String,
    pub table_group: String,
    /// 被拆分的旧分区
    pub split_partition: String,
    /// 拆分出的新分区组及其物理落点
    pub new_partition_groups: Vec<PartitionGroupSpec>,
    pub target_physical_groups: Vec<String>,
    /// 旧分区当前的物理拓扑（用于收尾清理）
    pub source_topology: BTreeMap<String, Vec<String>>,
    pub tables_version: BTreeMap<String, i64>,
    pub placement: TargetGroupPlacement,
    /// 调试用的最终可见性覆盖；非 `Public` 时在发布前插入暂停检查点
    pub final_visibility: Option<TableVisibility>,
    pub max_parallelism: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergePartitionPreparedData {
    pub schema_name: String,
    pub table_name: String,
    pub table_group: String,
    /// 被合并的旧分区
    pub merge_partitions: Vec<String>,
    /// 合并后的新分区组
    pub new_partition_group: PartitionGroupSpec,
    pub target_physical_groups: Vec<String>,
    pub source_topology: BTreeMap<String, Vec<String>>,
    pub tables_version: BTreeMap<String, i64>,
    pub final_visibility: Option<TableVisibility>,
    pub max_parallelism: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MovePartitionPreparedData {
    pub schema_name: String,
    pub table_name: String,
    pub table_group: String,
    /// 待搬迁的分区及其新的物理落点
    pub partitions: Vec<PartitionGroupSpec>,
    pub target_physical_groups: Vec<String>,
    pub source_topology: BTreeMap<String, Vec<String>>,
    pub tables_version: BTreeMap<String, i64>,
    pub final_visibility: Option<TableVisibility>,
    pub max_parallelism: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateGlobalIndexPreparedData {
    pub schema_name: String,
    pub table_name: String,
    pub table_group: String,
    pub index_name: String,
    pub columns: Vec<String>,
    /// 索引表的物理拓扑
    pub index_topology: BTreeMap<String, Vec<String>>,
    pub tables_version: BTreeMap<String, i64>,
    pub final_visibility: Option<TableVisibility>,
    pub max_parallelism: Option<usize>,
}

/// 表组重组：把若干成员表的分区搬迁进目标表组的物理分组
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReorgTableGroupPreparedData {
    pub schema_name: String,
    pub table_group: String,
    /// 表 -> 待搬迁分区组
    pub table_partitions: BTreeMap<String, Vec<PartitionGroupSpec>>,
    pub target_physical_groups: Vec<String>,
    /// 表 -> 旧物理拓扑
    pub source_topologies: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub tables_version: BTreeMap<String, i64>,
    pub max_parallelism: Option<usize>,
}

/// 一次DDL操作请求：构建器的输入接口
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation")]
pub enum DdlRequest {
    SplitPartition(SplitPartitionPreparedData),
    MergePartition(MergePartitionPreparedData),
    MovePartition(MovePartitionPreparedData),
    CreateGlobalIndex(CreateGlobalIndexPreparedData),
    ReorgTableGroup(ReorgTableGroupPreparedData),
}

impl DdlRequest {
    pub fn schema_name(&self) -> &str {
        match self {
            DdlRequest::SplitPartition(d) => &d.schema_name,
            DdlRequest::MergePartition(d) => &d.schema_name,
            DdlRequest::MovePartition(d) => &d.schema_name,
            DdlRequest::CreateGlobalIndex(d) => &d.schema_name,
            DdlRequest::ReorgTableGroup(d) => &d.schema_name,
        }
    }

    pub fn description(&self) -> String {
        match self {
            DdlRequest::SplitPartition(d) => format!(
                "split partition {} of {}.{}",
                d.split_partition, d.schema_name, d.table_name
            ),
            DdlRequest::MergePartition(d) => format!(
                "merge partitions {:?} of {}.{}",
                d.merge_partitions, d.schema_name, d.table_name
            ),
            DdlRequest::MovePartition(d) => format!(
                "move {} partition(s) of {}.{}",
                d.partitions.len(),
                d.schema_name,
                d.table_name
            ),
            DdlRequest::CreateGlobalIndex(d) => format!(
                "create global index {} on {}.{}",
                d.index_name, d.schema_name, d.table_name
            ),
            DdlRequest::ReorgTableGroup(d) => format!(
                "reorganize table group {}.{}",
                d.schema_name, d.table_group
            ),
        }
    }
}
