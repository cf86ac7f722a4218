//! SQLite仓储的持久化往返测试

use std::collections::BTreeMap;

use ddl_domain::{
    AddMetaSpec, DdlTask, JobGraph, JobRepository, JobState, OperatorAction, TaskPayload,
    TaskState, ValidateSpec,
};
use ddl_infrastructure::SqliteJobRepository;

async fn repository() -> (SqliteJobRepository, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/ddl_jobs.db", dir.path().display());
    let repo = SqliteJobRepository::connect(&url).await.unwrap();
    (repo, dir)
}

fn sample_graph() -> JobGraph {
    let mut graph = JobGraph::new("d1");
    let validate = graph.add_task(DdlTask::new(
        "d1",
        TaskPayload::Validate(ValidateSpec::TableGroupVersion {
            table_group: "tg_orders".to_string(),
            tables_version: BTreeMap::from([("orders".to_string(), 3)]),
        }),
    ));
    let add_meta = graph.add_task(DdlTask::new(
        "d1",
        TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
            table_group: "tg_orders".to_string(),
            outdated_partitions: vec!["p1".to_string()],
            invisible_partition_groups: vec![],
        }),
    ));
    graph.add_task_relationship(validate, add_meta).unwrap();
    graph.label_as_tail(add_meta);
    graph.excluded_resources.insert("d1.tablegroup.tg_orders".to_string());
    graph.max_parallelism = 4;
    graph
}

#[tokio::test]
async fn test_create_and_load_round_trip() {
    let (repo, _dir) = repository().await;

    let mut graph = sample_graph();
    let job_id = repo.create_job(&mut graph).await.unwrap();
    assert!(job_id > 0);

    let loaded = repo.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(loaded.schema_name, "d1");
    assert_eq!(loaded.state, JobState::Pending);
    assert_eq!(loaded.tasks.len(), 2);
    assert_eq!(loaded.edges.len(), 1);
    assert_eq!(loaded.labeled_tail, Some(2));
    assert_eq!(loaded.max_parallelism, 4);
    assert!(loaded
        .excluded_resources
        .contains("d1.tablegroup.tg_orders"));
    // 载荷经JSON往返后按kind还原
    assert_eq!(loaded.tasks[&1].kind(), "Validate");
    assert_eq!(loaded.tasks[&2].kind(), "AddMeta");
    assert_eq!(loaded.tasks[&1].payload, graph.tasks[&1].payload);
}

#[tokio::test]
async fn test_task_state_updates_are_persisted() {
    let (repo, _dir) = repository().await;

    let mut graph = sample_graph();
    let job_id = repo.create_job(&mut graph).await.unwrap();

    let task = graph.task_mut(1).unwrap();
    task.mark(TaskState::Success);
    task.message = Some("校验通过".to_string());
    let snapshot = task.clone();
    repo.update_task(&snapshot).await.unwrap();

    let loaded = repo.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(loaded.tasks[&1].state, TaskState::Success);
    assert_eq!(loaded.tasks[&1].message.as_deref(), Some("校验通过"));
}

#[tokio::test]
async fn test_unknown_job_and_task_are_reported() {
    let (repo, _dir) = repository().await;

    assert!(repo.get_job(404).await.unwrap().is_none());
    assert!(repo
        .update_job_state(404, JobState::Running, None)
        .await
        .is_err());

    let mut graph = sample_graph();
    repo.create_job(&mut graph).await.unwrap();
    let mut orphan = graph.tasks[&1].clone();
    orphan.id = 99;
    assert!(repo.update_task(&orphan).await.is_err());
}

#[tokio::test]
async fn test_active_jobs_exclude_terminal_states() {
    let (repo, _dir) = repository().await;

    let mut success = sample_graph();
    let success_id = repo.create_job(&mut success).await.unwrap();
    repo.update_job_state(success_id, JobState::Success, None)
        .await
        .unwrap();

    let mut paused = sample_graph();
    let paused_id = repo.create_job(&mut paused).await.unwrap();
    repo.update_job_state(paused_id, JobState::Paused, Some("暂停检查点"))
        .await
        .unwrap();

    let mut frozen = sample_graph();
    let frozen_id = repo.create_job(&mut frozen).await.unwrap();
    repo.update_job_state(frozen_id, JobState::RollbackFailed, Some("需要人工介入"))
        .await
        .unwrap();

    let active = repo.load_active_jobs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].job_id, paused_id);
    assert_eq!(active[0].error_message.as_deref(), Some("暂停检查点"));
}

#[tokio::test]
async fn test_commands_are_appended_and_consumed_once() {
    let (repo, _dir) = repository().await;

    let mut graph = sample_graph();
    let job_id = repo.create_job(&mut graph).await.unwrap();

    repo.append_command(job_id, OperatorAction::Pause, "dba")
        .await
        .unwrap();
    repo.append_command(job_id, OperatorAction::SkipTask { task_id: 2 }, "dba")
        .await
        .unwrap();

    let commands = repo.take_pending_commands(job_id).await.unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].action, OperatorAction::Pause);
    assert_eq!(
        commands[1].action,
        OperatorAction::SkipTask { task_id: 2 }
    );
    assert!(commands.iter().all(|c| c.consumed));

    assert!(repo.take_pending_commands(job_id).await.unwrap().is_empty());

    // 不存在的作业拒绝追加指令
    assert!(repo
        .append_command(404, OperatorAction::Pause, "dba")
        .await
        .is_err());
}
