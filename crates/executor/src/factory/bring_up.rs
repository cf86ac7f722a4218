//! 重组拉起（bring-up）的公共机制
//!
//! 各分区类工厂共享同一段收尾拓扑：物理子图（建staged表 + 回填）、
//! 变更标记、可见性阶梯，以及可选的清理旧物理表。

use std::collections::BTreeMap;

use ddl_core::DdlResult;
use ddl_domain::{
    BackfillSpec, DdlTask, DropPhysicalTablesSpec, JobGraph, PartitionGroupSpec, PhysicalDdlSpec,
    SyncNotifySpec, TableVisibility, TaskPayload, UpdateVisibilitySpec,
};

/// staged分区的物理表命名
pub fn phy_table_name(table_name: &str, partition: &str) -> String {
    format!("{table_name}_{partition}")
}

/// 可见性阶梯：把重组后的拓扑逐级推向 `Public`
pub fn bring_up_tasks(schema_name: &str, object_name: &str) -> Vec<DdlTask> {
    let ladder = [
        (TableVisibility::DoingReorg, TableVisibility::DeleteOnly),
        (TableVisibility::DeleteOnly, TableVisibility::WriteOnly),
        (TableVisibility::WriteOnly, TableVisibility::ReadyToPublic),
        (TableVisibility::ReadyToPublic, TableVisibility::Public),
    ];
    ladder
        .into_iter()
        .map(|(previous, target)| {
            DdlTask::new(
                schema_name,
                TaskPayload::UpdateVisibility(UpdateVisibilitySpec {
                    object_name: object_name.to_string(),
                    target,
                    previous,
                }),
            )
        })
        .collect()
}

pub fn drop_stale_tables_task(
    schema_name: &str,
    topology: BTreeMap<String, Vec<String>>,
) -> DdlTask {
    DdlTask::new(
        schema_name,
        TaskPayload::DropPhysicalTables(DropPhysicalTablesSpec { topology }),
    )
}

/// 物理拉起子图：并行创建staged物理表，全部建好后回填数据
///
/// 头尾均已标记，可直接 `combine` 进外层作业图继续拼接。
pub fn staged_topology_graph(
    schema_name: &str,
    table_name: &str,
    partition_groups: &[PartitionGroupSpec],
    source_partitions: &[String],
    backfill_batch_size: u64,
) -> DdlResult<JobGraph> {
    let mut graph = JobGraph::new(schema_name);

    let head = graph.add_task(DdlTask::new(schema_name, TaskPayload::Empty));
    graph.label_as_head(head);

    let mut create_ids = Vec::with_capacity(partition_groups.len());
    for group in partition_groups {
        let phy_table = phy_table_name(table_name, &group.name);
        let create = graph.add_task(DdlTask::new(
            schema_name,
            TaskPayload::PhysicalDdl(PhysicalDdlSpec {
                topology: BTreeMap::from([(group.phy_db.clone(), vec![phy_table])]),
                statement: format!("CREATE TABLE IF NOT EXISTS {{table}} LIKE {table_name}"),
                compensating_statement: Some("DROP TABLE IF EXISTS {table}".to_string()),
                idempotent: true,
            }),
        ));
        graph.add_task_relationship(head, create)?;
        create_ids.push(create);
    }

    let backfill = graph.add_task(DdlTask::new(
        schema_name,
        TaskPayload::Backfill(BackfillSpec {
            table_name: table_name.to_string(),
            source_partitions: source_partitions.to_vec(),
            target_partitions: partition_groups.iter().map(|g| g.name.clone()).collect(),
            batch_size: backfill_batch_size,
        }),
    ));
    for create in create_ids {
        graph.add_task_relationship(create, backfill)?;
    }
    graph.label_as_tail(backfill);

    Ok(graph)
}

/// 重组收尾参数
pub struct ReorgTailParams<'a> {
    pub schema_name: &'a str,
    pub table_name: &'a str,
    /// 可见性与变更通知针对的对象（表组名）
    pub object_name: &'a str,
    pub new_partition_groups: &'a [PartitionGroupSpec],
    pub source_partitions: &'a [String],
    pub source_topology: &'a BTreeMap<String, Vec<String>>,
    pub final_visibility: Option<TableVisibility>,
    pub backfill_batch_size: u64,
}

/// 在 `after` 之后拼接重组收尾：
/// 物理子图 -> 变更标记 -> 可见性阶梯 -> 清理旧表（保持在Public时），
/// 或 物理子图 -> 变更标记 -> 暂停检查点（发布前人工校验）
pub fn append_reorg_tail(job: &mut JobGraph, after: i64, params: ReorgTailParams) -> DdlResult<()> {
    let staged = staged_topology_graph(
        params.schema_name,
        params.table_name,
        params.new_partition_groups,
        params.source_partitions,
        params.backfill_batch_size,
    )?;
    let stitched = job.combine(staged)?;
    job.add_task_relationship(after, stitched.head)?;

    // 变更标记经由空任务锚点接入，保持与物理子图的边界清晰
    let anchor = job.add_task(DdlTask::new(params.schema_name, TaskPayload::Empty));
    let mark = job.add_task(DdlTask::new(
        params.schema_name,
        TaskPayload::SyncNotify(SyncNotifySpec {
            object_name: params.object_name.to_string(),
            mark: TableVisibility::DoingReorg.as_str().to_string(),
        }),
    ));
    job.add_task_relationship(stitched.tail, anchor)?;
    job.add_task_relationship(anchor, mark)?;

    let stay_at_public = matches!(
        params.final_visibility,
        None | Some(TableVisibility::Public)
    );
    if stay_at_public {
        let ladder_ids =
            job.add_sequential_tasks(bring_up_tasks(params.schema_name, params.object_name))?;
        job.add_task_relationship(mark, ladder_ids[0])?;

        let drop_stale = job.add_task(drop_stale_tables_task(
            params.schema_name,
            params.source_topology.clone(),
        ));
        job.add_task_relationship(*ladder_ids.last().expect("阶梯非空"), drop_stale)?;
        job.label_as_tail(drop_stale);
    } else {
        // 调试覆盖：发布前停在检查点，由操作员确认后再继续
        let pause = job.add_task(DdlTask::new(params.schema_name, TaskPayload::Pause));
        job.add_task_relationship(mark, pause)?;
        job.label_as_tail(pause);
    }
    Ok(())
}
