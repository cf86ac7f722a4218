//! 分区拆分作业工厂
//!
//! 三种目标落位对应三种拓扑：
//! - 留在原表组：校验 -> 登记重组元数据 -> 物理拉起 -> 阶梯发布 -> 清理；
//! - 迁入已有表组：源/目标表组并行校验后汇入登记任务，其余同上；
//! - 建新表组：校验 -> 子作业(表迁入新组) -> 子作业(组内拆分)。

use std::collections::{BTreeMap, BTreeSet};

use ddl_core::{DdlEngineError, DdlResult, ExecutorConfig};
use ddl_domain::{
    AddMetaSpec, DdlRequest, DdlTask, JobGraph, PartitionGroupSpec, ReorgTableGroupPreparedData,
    SplitPartitionPreparedData, SubJobSpec, TargetGroupPlacement, TaskPayload, ValidateSpec,
};

use super::bring_up::{append_reorg_tail, ReorgTailParams};
use super::{partition_resource, table_group_resource, table_resource, JobFactory};

pub struct SplitPartitionJobFactory {
    prepared: SplitPartitionPreparedData,
    default_parallelism: usize,
    backfill_batch_size: u64,
}

impl SplitPartitionJobFactory {
    pub fn new(prepared: SplitPartitionPreparedData, config: &ExecutorConfig) -> Self {
        Self {
            prepared,
            default_parallelism: config.default_max_parallelism,
            backfill_batch_size: config.backfill_batch_size,
        }
    }

    fn max_parallelism(&self) -> usize {
        self.prepared
            .max_parallelism
            .unwrap_or(self.default_parallelism)
            .max(1)
    }

    /// 拆分后留在原表组
    fn split_in_origin_table_group(&self) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let validate = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: d.table_group.clone(),
                tables_version: d.tables_version.clone(),
            }),
        ));
        let add_meta = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
                table_group: d.table_group.clone(),
                outdated_partitions: vec![d.split_partition.clone()],
                invisible_partition_groups: d.new_partition_groups.clone(),
            }),
        ));
        job.add_task_relationship(validate, add_meta)?;

        self.append_tail(&mut job, add_meta, &d.table_group)?;
        job.max_parallelism = self.max_parallelism();
        Ok(job)
    }

    /// 拆分并迁入已存在的表组：源/目标并行校验，单个登记任务依赖全部校验
    fn split_and_move_to_exist_table_group(
        &self,
        target_table_group: &str,
        target_tables_version: &BTreeMap<String, i64>,
    ) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let anchor = job.add_task(DdlTask::new(&d.schema_name, TaskPayload::Empty));
        let validate_source = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: d.table_group.clone(),
                tables_version: d.tables_version.clone(),
            }),
        ));
        let validate_target = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: target_table_group.to_string(),
                tables_version: target_tables_version.clone(),
            }),
        ));
        let validate_groups = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::PhysicalGroupsAvailable {
                groups: d.target_physical_groups.clone(),
            }),
        ));
        job.add_task_relationship(anchor, validate_source)?;
        job.add_task_relationship(anchor, validate_target)?;
        job.add_task_relationship(anchor, validate_groups)?;

        let add_meta = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
                table_group: target_table_group.to_string(),
                outdated_partitions: vec![d.split_partition.clone()],
                invisible_partition_groups: d.new_partition_groups.clone(),
            }),
        ));
        job.add_task_relationship(validate_source, add_meta)?;
        job.add_task_relationship(validate_target, add_meta)?;
        job.add_task_relationship(validate_groups, add_meta)?;

        self.append_tail(&mut job, add_meta, target_table_group)?;
        job.max_parallelism = self.max_parallelism();
        Ok(job)
    }

    /// 先把表迁入新建表组，再在新组内拆分；两步都是子作业，
    /// 全程复用父作业已持有的资源
    fn split_in_new_table_group(&self, new_table_group: &str) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let validate = DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: d.table_group.clone(),
                tables_version: d.tables_version.clone(),
            }),
        );

        let move_table_request = DdlRequest::ReorgTableGroup(ReorgTableGroupPreparedData {
            schema_name: d.schema_name.clone(),
            table_group: new_table_group.to_string(),
            table_partitions: BTreeMap::from([(
                d.table_name.clone(),
                vec![PartitionGroupSpec {
                    name: d.split_partition.clone(),
                    phy_db: d
                        .target_physical_groups
                        .first()
                        .cloned()
                        .unwrap_or_default(),
                }],
            )]),
            target_physical_groups: d.target_physical_groups.clone(),
            source_topologies: BTreeMap::from([(
                d.table_name.clone(),
                d.source_topology.clone(),
            )]),
            tables_version: d.tables_version.clone(),
            max_parallelism: d.max_parallelism,
        });
        let sub_job_move = DdlTask::new(
            &d.schema_name,
            TaskPayload::SubJob(SubJobSpec {
                request: move_table_request,
                parent_acquire_resource: true,
            }),
        );

        let split_request = DdlRequest::SplitPartition(SplitPartitionPreparedData {
            table_group: new_table_group.to_string(),
            placement: TargetGroupPlacement::RemainInOriginalTableGroup,
            ..d.clone()
        });
        let sub_job_split = DdlTask::new(
            &d.schema_name,
            TaskPayload::SubJob(SubJobSpec {
                request: split_request,
                parent_acquire_resource: true,
            }),
        );

        job.add_sequential_tasks(vec![validate, sub_job_move, sub_job_split])?;
        job.max_parallelism = 1;
        Ok(job)
    }

    fn append_tail(&self, job: &mut JobGraph, after: i64, object_name: &str) -> DdlResult<()> {
        let d = &self.prepared;
        let source_partitions = vec![d.split_partition.clone()];
        append_reorg_tail(
            job,
            after,
            ReorgTailParams {
                schema_name: &d.schema_name,
                table_name: &d.table_name,
                object_name,
                new_partition_groups: &d.new_partition_groups,
                source_partitions: &source_partitions,
                source_topology: &d.source_topology,
                final_visibility: d.final_visibility,
                backfill_batch_size: self.backfill_batch_size,
            },
        )
    }
}

impl JobFactory for SplitPartitionJobFactory {
    fn validate(&self) -> DdlResult<()> {
        let d = &self.prepared;
        if d.split_partition.is_empty() {
            return Err(DdlEngineError::Validation(
                "待拆分分区不能为空".to_string(),
            ));
        }
        if d.new_partition_groups.len() < 2 {
            return Err(DdlEngineError::Validation(
                "拆分必须产生至少两个新分区".to_string(),
            ));
        }
        if let TargetGroupPlacement::MoveToExistingTableGroup {
            target_table_group, ..
        } = &d.placement
        {
            if target_table_group == &d.table_group {
                return Err(DdlEngineError::Validation(
                    "目标表组不能与源表组相同".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn do_create(&self) -> DdlResult<JobGraph> {
        match &self.prepared.placement {
            TargetGroupPlacement::RemainInOriginalTableGroup => self.split_in_origin_table_group(),
            TargetGroupPlacement::MoveToExistingTableGroup {
                target_table_group,
                target_tables_version,
            } => self.split_and_move_to_exist_table_group(target_table_group, target_tables_version),
            TargetGroupPlacement::CreateNewTableGroup { new_table_group } => {
                self.split_in_new_table_group(new_table_group)
            }
        }
    }

    fn excluded_resources(&self) -> BTreeSet<String> {
        let d = &self.prepared;
        let mut resources = BTreeSet::from([
            table_group_resource(&d.schema_name, &d.table_group),
            table_resource(&d.schema_name, &d.table_name),
            partition_resource(&d.schema_name, &d.table_name, &d.split_partition),
        ]);
        match &d.placement {
            TargetGroupPlacement::MoveToExistingTableGroup {
                target_table_group, ..
            } => {
                resources.insert(table_group_resource(&d.schema_name, target_table_group));
            }
            TargetGroupPlacement::CreateNewTableGroup { new_table_group } => {
                resources.insert(table_group_resource(&d.schema_name, new_table_group));
            }
            TargetGroupPlacement::RemainInOriginalTableGroup => {}
        }
        resources
    }
}
