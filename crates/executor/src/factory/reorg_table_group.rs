//! 表组重组作业工厂
//!
//! 把若干成员表的分区搬进目标表组的物理分组。每张表的搬迁是一个
//! 独立的子作业，顺序执行；子作业全程复用父作业已持有的资源。

use std::collections::BTreeSet;

use ddl_core::{DdlEngineError, DdlResult, ExecutorConfig};
use ddl_domain::{
    DdlRequest, DdlTask, JobGraph, MovePartitionPreparedData, ReorgTableGroupPreparedData,
    SubJobSpec, SyncNotifySpec, TaskPayload, ValidateSpec,
};

use super::{partition_resource, table_group_resource, table_resource, JobFactory};

pub struct ReorgTableGroupJobFactory {
    prepared: ReorgTableGroupPreparedData,
    default_parallelism: usize,
}

impl ReorgTableGroupJobFactory {
    pub fn new(prepared: ReorgTableGroupPreparedData, config: &ExecutorConfig) -> Self {
        Self {
            prepared,
            default_parallelism: config.default_max_parallelism,
        }
    }

    fn move_request_for(&self, table_name: &str) -> DdlResult<MovePartitionPreparedData> {
        let d = &self.prepared;
        let partitions = d
            .table_partitions
            .get(table_name)
            .ok_or_else(|| {
                DdlEngineError::Validation(format!("表 {table_name} 缺少分区搬迁计划"))
            })?
            .clone();
        let source_topology = d
            .source_topologies
            .get(table_name)
            .cloned()
            .unwrap_or_default();
        let mut tables_version = std::collections::BTreeMap::new();
        if let Some(version) = d.tables_version.get(table_name) {
            tables_version.insert(table_name.to_string(), *version);
        }
        Ok(MovePartitionPreparedData {
            schema_name: d.schema_name.clone(),
            table_name: table_name.to_string(),
            table_group: d.table_group.clone(),
            partitions,
            target_physical_groups: d.target_physical_groups.clone(),
            source_topology,
            tables_version,
            final_visibility: None,
            max_parallelism: d.max_parallelism,
        })
    }
}

impl JobFactory for ReorgTableGroupJobFactory {
    fn validate(&self) -> DdlResult<()> {
        if self.prepared.table_partitions.is_empty() {
            return Err(DdlEngineError::Validation(
                "重组的成员表列表不能为空".to_string(),
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

        let mut tasks = vec![DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::PhysicalGroupsAvailable {
                groups: d.target_physical_groups.clone(),
            }),
        )];
        for table_name in d.table_partitions.keys() {
            tasks.push(DdlTask::new(
                &d.schema_name,
                TaskPayload::SubJob(SubJobSpec {
                    request: DdlRequest::MovePartition(self.move_request_for(table_name)?),
                    parent_acquire_resource: true,
                }),
            ));
        }
        tasks.push(DdlTask::new(
            &d.schema_name,
            TaskPayload::SyncNotify(SyncNotifySpec {
                object_name: d.table_group.clone(),
                mark: "REORG_TABLE_GROUP".to_string(),
            }),
        ));
        let ids = job.add_sequential_tasks(tasks)?;
        job.label_as_tail(*ids.last().expect("任务列表非空"));

        job.max_parallelism = d
            .max_parallelism
            .unwrap_or(self.default_parallelism)
            .max(1);
        Ok(job)
    }

    fn excluded_resources(&self) -> BTreeSet<String> {
        let d = &self.prepared;
        let mut resources = BTreeSet::from([table_group_resource(&d.schema_name, &d.table_group)]);
        for (table_name, partitions) in &d.table_partitions {
            resources.insert(table_resource(&d.schema_name, table_name));
            for partition in partitions {
                resources.insert(partition_resource(
                    &d.schema_name,
                    table_name,
                    &partition.name,
                ));
            }
        }
        resources
    }
}
