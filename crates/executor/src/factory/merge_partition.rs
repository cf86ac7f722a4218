//! 分区合并作业工厂
//!
//! 与拆分共享同一段重组收尾，差异只在登记任务的方向：多个旧分区
//! 汇入一个新分区组。

use std::collections::BTreeSet;

use ddl_core::{DdlEngineError, DdlResult, ExecutorConfig};
use ddl_domain::{
    AddMetaSpec, DdlTask, JobGraph, MergePartitionPreparedData, TaskPayload, ValidateSpec,
};

use super::bring_up::{append_reorg_tail, ReorgTailParams};
use super::{partition_resource, table_group_resource, table_resource, JobFactory};

pub struct MergePartitionJobFactory {
    prepared: MergePartitionPreparedData,
    default_parallelism: usize,
    backfill_batch_size: u64,
}

impl MergePartitionJobFactory {
    pub fn new(prepared: MergePartitionPreparedData, config: &ExecutorConfig) -> Self {
        Self {
            prepared,
            default_parallelism: config.default_max_parallelism,
            backfill_batch_size: config.backfill_batch_size,
        }
    }
}

impl JobFactory for MergePartitionJobFactory {
    fn validate(&self) -> DdlResult<()> {
        if self.prepared.merge_partitions.len() < 2 {
            return Err(DdlEngineError::Validation(
                "合并必须涉及至少两个分区".to_string(),
            ));
        }
        Ok(())
    }

    fn do_create(&self) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let validate = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: d.table_group.clone(),
                tables_version: d.tables_version.clone(),
            }),
        ));
        let new_partition_groups = vec![d.new_partition_group.clone()];
        let add_meta = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
                table_group: d.table_group.clone(),
                outdated_partitions: d.merge_partitions.clone(),
                invisible_partition_groups: new_partition_groups.clone(),
            }),
        ));
        job.add_task_relationship(validate, add_meta)?;

        append_reorg_tail(
            &mut job,
            add_meta,
            ReorgTailParams {
                schema_name: &d.schema_name,
                table_name: &d.table_name,
                object_name: &d.table_group,
                new_partition_groups: &new_partition_groups,
                source_partitions: &d.merge_partitions,
                source_topology: &d.source_topology,
                final_visibility: d.final_visibility,
                backfill_batch_size: self.backfill_batch_size,
            },
        )?;

        job.max_parallelism = d
            .max_parallelism
            .unwrap_or(self.default_parallelism)
            .max(1);
        Ok(job)
    }

    fn excluded_resources(&self) -> BTreeSet<String> {
        let d = &self.prepared;
        let mut resources = BTreeSet::from([
            table_group_resource(&d.schema_name, &d.table_group),
            table_resource(&d.schema_name, &d.table_name),
        ]);
        for partition in &d.merge_partitions {
            resources.insert(partition_resource(&d.schema_name, &d.table_name, partition));
        }
        resources
    }
}
