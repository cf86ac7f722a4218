//! 测试数据构造器

use std::collections::BTreeMap;

use ddl_domain::{
    DdlTask, JobGraph, PartitionGroupSpec, SplitPartitionPreparedData, TargetGroupPlacement,
    TaskPayload,
};

/// 把一组载荷链接成直线作业图
pub fn linear_graph(schema_name: &str, payloads: Vec<TaskPayload>) -> JobGraph {
    let mut graph = JobGraph::new(schema_name);
    let tasks: Vec<DdlTask> = payloads
        .into_iter()
        .map(|payload| DdlTask::new(schema_name, payload))
        .collect();
    graph
        .add_sequential_tasks(tasks)
        .expect("直线图构建不应失败");
    graph
}

/// 一份可以直接跑通的分区拆分准备数据：
/// `tg_orders` 的 `p1` 拆成 `p1a`/`p1b`，留在原表组
pub fn split_prepared(schema_name: &str) -> SplitPartitionPreparedData {
    SplitPartitionPreparedData {
        schema_name: schema_name.to_string(),
        table_name: "orders".to_string(),
        table_group: "tg_orders".to_string(),
        split_partition: "p1".to_string(),
        new_partition_groups: vec![
            PartitionGroupSpec {
                name: "p1a".to_string(),
                phy_db: "dn0".to_string(),
            },
            PartitionGroupSpec {
                name: "p1b".to_string(),
                phy_db: "dn1".to_string(),
            },
        ],
        target_physical_groups: vec!["dn0".to_string(), "dn1".to_string()],
        source_topology: BTreeMap::from([(
            "dn0".to_string(),
            vec!["orders_p1".to_string()],
        )]),
        tables_version: BTreeMap::from([("orders".to_string(), 1)]),
        placement: TargetGroupPlacement::RemainInOriginalTableGroup,
        final_visibility: None,
        max_parallelism: Some(2),
    }
}
