//! 分区搬迁作业工厂
//!
//! 分区名不变，物理落点改变：在目标分组建staged表、回填、阶梯发布，
//! 最后清理源端物理表。

use std::collections::BTreeSet;

use ddl_core::{DdlEngineError, DdlResult, ExecutorConfig};
use ddl_domain::{
    AddMetaSpec, DdlTask, JobGraph, MovePartitionPreparedData, TaskPayload, ValidateSpec,
};

use super::bring_up::{append_reorg_tail, ReorgTailParams};
use super::{partition_resource, table_group_resource, table_resource, JobFactory};

pub struct MovePartitionJobFactory {
    prepared: MovePartitionPreparedData,
    default_parallelism: usize,
    backfill_batch_size: u64,
}

impl MovePartitionJobFactory {
    pub fn new(prepared: MovePartitionPreparedData, config: &ExecutorConfig) -> Self {
        Self {
            prepared,
            default_parallelism: config.default_max_parallelism,
            backfill_batch_size: config.backfill_batch_size,
        }
    }
}

impl JobFactory for MovePartitionJobFactory {
    fn validate(&self) -> DdlResult<()> {
        if self.prepared.partitions.is_empty() {
            return Err(DdlEngineError::Validation(
                "搬迁分区列表不能为空".to_string(),
            ));
        }
        if self.prepared.target_physical_groups.is_empty() {
            return Err(DdlEngineError::Validation(
                "目标物理分组不能为空".to_string(),
            ));
        }
        Ok(())
    }

    fn do_create(&self) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let validate = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::PhysicalGroupsAvailable {
                groups: d.target_physical_groups.clone(),
            }),
        ));
        let partition_names: Vec<String> =
            d.partitions.iter().map(|p| p.name.clone()).collect();
        let add_meta = job.add_task(DdlTask::new(
            &d.schema_name,
            TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
                table_group: d.table_group.clone(),
                outdated_partitions: partition_names.clone(),
                invisible_partition_groups: d.partitions.clone(),
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
                new_partition_groups: &d.partitions,
                source_partitions: &partition_names,
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
        for partition in &d.partitions {
            resources.insert(partition_resource(
                &d.schema_name,
                &d.table_name,
                &partition.name,
            ));
        }
        resources
    }
}
