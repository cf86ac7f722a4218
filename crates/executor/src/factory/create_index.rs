//! 全局索引构建作业工厂
//!
//! 校验 -> 登记索引元数据 -> 创建物理索引表 -> 全量回填 ->
//! 可见性阶梯 -> 变更通知。索引对象沿用与表组重组相同的可见性机制。

use std::collections::BTreeSet;

use ddl_core::{DdlEngineError, DdlResult, ExecutorConfig};
use ddl_domain::{
    AddMetaSpec, BackfillSpec, CreateGlobalIndexPreparedData, DdlTask, JobGraph, PhysicalDdlSpec,
    SyncNotifySpec, TaskPayload, ValidateSpec,
};

use super::bring_up::bring_up_tasks;
use super::{table_group_resource, table_resource, JobFactory};

pub struct CreateGlobalIndexJobFactory {
    prepared: CreateGlobalIndexPreparedData,
    default_parallelism: usize,
    backfill_batch_size: u64,
}

impl CreateGlobalIndexJobFactory {
    pub fn new(prepared: CreateGlobalIndexPreparedData, config: &ExecutorConfig) -> Self {
        Self {
            prepared,
            default_parallelism: config.default_max_parallelism,
            backfill_batch_size: config.backfill_batch_size,
        }
    }
}

impl JobFactory for CreateGlobalIndexJobFactory {
    fn validate(&self) -> DdlResult<()> {
        let d = &self.prepared;
        if d.columns.is_empty() {
            return Err(DdlEngineError::Validation(
                "索引列不能为空".to_string(),
            ));
        }
        if d.index_topology.is_empty() {
            return Err(DdlEngineError::Validation(
                "索引物理拓扑不能为空".to_string(),
            ));
        }
        Ok(())
    }

    fn do_create(&self) -> DdlResult<JobGraph> {
        let d = &self.prepared;
        let mut job = JobGraph::new(&d.schema_name);

        let validate = DdlTask::new(
            &d.schema_name,
            TaskPayload::Validate(ValidateSpec::TableGroupVersion {
                table_group: d.table_group.clone(),
                tables_version: d.tables_version.clone(),
            }),
        );
        let add_meta = DdlTask::new(
            &d.schema_name,
            TaskPayload::AddMeta(AddMetaSpec::GlobalIndex {
                table_name: d.table_name.clone(),
                index_name: d.index_name.clone(),
                columns: d.columns.clone(),
            }),
        );
        let create_index_tables = DdlTask::new(
            &d.schema_name,
            TaskPayload::PhysicalDdl(PhysicalDdlSpec {
                topology: d.index_topology.clone(),
                statement: format!(
                    "CREATE TABLE IF NOT EXISTS {{table}} /* 全局索引 {} ({}) */",
                    d.index_name,
                    d.columns.join(", ")
                ),
                compensating_statement: Some("DROP TABLE IF EXISTS {table}".to_string()),
                idempotent: true,
            }),
        );
        let index_tables: Vec<String> = d
            .index_topology
            .values()
            .flatten()
            .cloned()
            .collect();
        let backfill = DdlTask::new(
            &d.schema_name,
            TaskPayload::Backfill(BackfillSpec {
                table_name: d.table_name.clone(),
                // 空列表表示全表扫描回填
                source_partitions: Vec::new(),
                target_partitions: index_tables,
                batch_size: self.backfill_batch_size,
            }),
        );

        let mut tasks = vec![validate, add_meta, create_index_tables, backfill];
        tasks.extend(bring_up_tasks(&d.schema_name, &d.index_name));
        tasks.push(DdlTask::new(
            &d.schema_name,
            TaskPayload::SyncNotify(SyncNotifySpec {
                object_name: d.index_name.clone(),
                mark: "CREATE_GLOBAL_INDEX".to_string(),
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
        BTreeSet::from([
            table_group_resource(&d.schema_name, &d.table_group),
            table_resource(&d.schema_name, &d.table_name),
            table_resource(&d.schema_name, &d.index_name),
        ])
    }
}
