//! DAG调度器的行为测试：回滚协议、并行度上限、暂停/跳过、崩溃恢复

mod common;

use std::collections::BTreeMap;

use ddl_domain::{
    AddMetaSpec, DdlTask, JobGraph, JobRepository, JobState, OperatorAction, PhysicalDdlSpec,
    TaskPayload, TaskState, ValidateSpec,
};
use ddl_executor::{DagExecutor, DdlEngine, RecoveryConfig, StartupRecoveryService};
use ddl_testing_utils::{linear_graph, CountingPhysicalExecutor};

use common::{harness, harness_with, TestHarness};

fn validate_payload() -> TaskPayload {
    TaskPayload::Validate(ValidateSpec::TableGroupVersion {
        table_group: "tg_orders".to_string(),
        tables_version: BTreeMap::new(),
    })
}

fn add_meta_payload(table_group: &str) -> TaskPayload {
    TaskPayload::AddMeta(AddMetaSpec::PartitionReorg {
        table_group: table_group.to_string(),
        outdated_partitions: vec!["p1".to_string()],
        invisible_partition_groups: vec![],
    })
}

fn physical_payload(statement: &str, compensating: Option<&str>, idempotent: bool) -> TaskPayload {
    TaskPayload::PhysicalDdl(PhysicalDdlSpec {
        topology: BTreeMap::from([("dn0".to_string(), vec!["orders_p1a".to_string()])]),
        statement: statement.to_string(),
        compensating_statement: compensating.map(|s| s.to_string()),
        idempotent,
    })
}

fn bring_up_payload() -> TaskPayload {
    physical_payload(
        "CREATE TABLE IF NOT EXISTS {table}",
        Some("DROP TABLE IF EXISTS {table}"),
        true,
    )
}

async fn run_graph(h: &TestHarness, mut graph: JobGraph) -> (JobState, JobGraph) {
    h.repository.create_job(&mut graph).await.unwrap();
    let ticket = h
        .ctx
        .admission
        .admit(&graph.schema_name, &graph.excluded_resources)
        .unwrap();
    let executor = DagExecutor::new(h.ctx.clone());
    let state = executor.execute(&mut graph, ticket).await.unwrap();
    h.ctx.admission.release(ticket);
    (state, graph)
}

#[tokio::test]
async fn test_linear_job_runs_to_success() {
    let h = harness();
    h.meta.register_table_group("d1", "tg_orders", BTreeMap::new());

    let graph = linear_graph(
        "d1",
        vec![validate_payload(), add_meta_payload("tg_orders"), bring_up_payload()],
    );
    let (state, graph) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::Success);
    assert!(graph.tasks.values().all(|t| t.state == TaskState::Success));
    assert_eq!(h.meta.journal(), vec!["ADD_META d1.tg_orders"]);
    assert_eq!(h.physical.executed_statements().len(), 1);

    // 持久化的终态与内存一致
    let stored = h.repository.get_job(graph.job_id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Success);
}

/// 三任务直线图 `validate -> addMeta -> bringUp`，bringUp确定性失败：
/// addMeta被补偿，validate无持久副作用，作业终止于 `RolledBack`
#[tokio::test]
async fn test_failing_bring_up_rolls_back_in_reverse_order() {
    let h = harness();
    h.meta.register_table_group("d1", "tg_orders", BTreeMap::new());
    h.physical.fail_statements_containing("FAIL_MARKER");

    let graph = linear_graph(
        "d1",
        vec![
            validate_payload(),
            add_meta_payload("tg_orders"),
            physical_payload("CREATE TABLE FAIL_MARKER {table}", None, true),
        ],
    );
    let (state, graph) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::RolledBack);
    // 元数据登记恰好被补偿一次，且发生在登记之后
    assert_eq!(
        h.meta.journal(),
        vec!["ADD_META d1.tg_orders", "REMOVE_META d1.tg_orders"]
    );
    assert_eq!(graph.tasks[&1].state, TaskState::RolledBack);
    assert_eq!(graph.tasks[&2].state, TaskState::RolledBack);
    assert_eq!(graph.tasks[&3].state, TaskState::Failed);
    assert!(graph.error_message.as_deref().unwrap().contains("任务 3"));
    // 失败的物理语句没有留下任何已执行记录
    assert!(h.physical.executed_statements().is_empty());
}

/// 多个成功任务的回滚按逆拓扑序进行，每个恰好补偿一次
#[tokio::test]
async fn test_rollback_compensates_successors_before_predecessors() {
    let h = harness();
    h.physical.fail_statements_containing("FAIL_MARKER");

    let graph = linear_graph(
        "d1",
        vec![
            add_meta_payload("tg_a"),
            add_meta_payload("tg_b"),
            physical_payload("FAIL_MARKER", None, true),
        ],
    );
    let (state, _) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::RolledBack);
    assert_eq!(
        h.meta.journal(),
        vec![
            "ADD_META d1.tg_a",
            "ADD_META d1.tg_b",
            "REMOVE_META d1.tg_b",
            "REMOVE_META d1.tg_a",
        ]
    );
}

/// `maxParallelism = 2` 的四个独立任务，任意时刻在途不超过2个
#[tokio::test]
async fn test_max_parallelism_is_respected() {
    let h = harness_with(CountingPhysicalExecutor::with_delay_ms(30));

    let mut graph = JobGraph::new("d1");
    for i in 0..4 {
        graph.add_task(DdlTask::new(
            "d1",
            physical_payload(&format!("CREATE TABLE t{i} {{table}}"), None, true),
        ));
    }
    graph.max_parallelism = 2;

    let (state, _) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::Success);
    assert_eq!(h.physical.executed_statements().len(), 4);
    assert!(
        h.physical.max_observed_concurrency() <= 2,
        "观测到的并发度 {} 超过上限",
        h.physical.max_observed_concurrency()
    );
}

/// 在 `addMeta` 与 `bringUp` 之间插入暂停任务：作业停在 `Paused`，
/// 显式恢复后从 `bringUp` 继续
#[tokio::test]
async fn test_pause_checkpoint_halts_until_resume() {
    let h = harness();
    h.meta.register_table_group("d1", "tg_orders", BTreeMap::new());

    let graph = linear_graph(
        "d1",
        vec![
            validate_payload(),
            add_meta_payload("tg_orders"),
            TaskPayload::Pause,
            bring_up_payload(),
        ],
    );
    let (state, graph) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::Paused);
    assert!(h.physical.executed_statements().is_empty());
    assert_eq!(graph.tasks[&4].state, TaskState::Created);

    // 显式恢复：重新装载并继续驱动
    let mut reloaded = h.repository.get_job(graph.job_id).await.unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Paused);
    let ticket = h
        .ctx
        .admission
        .admit(&reloaded.schema_name, &reloaded.excluded_resources)
        .unwrap();
    let executor = DagExecutor::new(h.ctx.clone());
    let state = executor.execute(&mut reloaded, ticket).await.unwrap();

    assert_eq!(state, JobState::Success);
    assert_eq!(h.physical.executed_statements().len(), 1);
}

/// 跳过指令把尚未执行的任务标记为空成功
#[tokio::test]
async fn test_skip_marks_pending_task_vacuously_successful() {
    let h = harness();
    h.meta.register_table_group("d1", "tg_orders", BTreeMap::new());

    let mut graph = linear_graph("d1", vec![validate_payload(), bring_up_payload()]);
    h.repository.create_job(&mut graph).await.unwrap();
    h.repository
        .append_command(graph.job_id, OperatorAction::SkipTask { task_id: 2 }, "op")
        .await
        .unwrap();

    let ticket = h
        .ctx
        .admission
        .admit(&graph.schema_name, &graph.excluded_resources)
        .unwrap();
    let executor = DagExecutor::new(h.ctx.clone());
    let state = executor.execute(&mut graph, ticket).await.unwrap();

    assert_eq!(state, JobState::Success);
    assert!(h.physical.executed_statements().is_empty());
    assert_eq!(graph.tasks[&2].state, TaskState::Success);
    assert_eq!(
        graph.tasks[&2].message.as_deref(),
        Some("由操作员跳过执行")
    );
}

/// 外部暂停请求在下一个调度点生效
#[tokio::test]
async fn test_external_pause_request_parks_the_job() {
    let h = harness();

    let mut graph = linear_graph("d1", vec![bring_up_payload()]);
    h.repository.create_job(&mut graph).await.unwrap();
    h.repository
        .append_command(graph.job_id, OperatorAction::Pause, "op")
        .await
        .unwrap();

    let ticket = h
        .ctx
        .admission
        .admit(&graph.schema_name, &graph.excluded_resources)
        .unwrap();
    let executor = DagExecutor::new(h.ctx.clone());
    let state = executor.execute(&mut graph, ticket).await.unwrap();

    assert_eq!(state, JobState::Paused);
    assert!(h.physical.executed_statements().is_empty());
}

/// 操作员回滚指令等同于一次无失败任务的作业失败
#[tokio::test]
async fn test_operator_rollback_request() {
    let h = harness();

    let mut graph = linear_graph("d1", vec![add_meta_payload("tg_a"), bring_up_payload()]);
    h.repository.create_job(&mut graph).await.unwrap();
    h.repository
        .append_command(graph.job_id, OperatorAction::Rollback, "op")
        .await
        .unwrap();

    let ticket = h
        .ctx
        .admission
        .admit(&graph.schema_name, &graph.excluded_resources)
        .unwrap();
    let executor = DagExecutor::new(h.ctx.clone());
    let state = executor.execute(&mut graph, ticket).await.unwrap();

    assert_eq!(state, JobState::RolledBack);
    assert!(h.meta.journal().is_empty());
}

/// 瞬时基础设施错误在任务边界内重试，不触发作业回滚
#[tokio::test]
async fn test_infra_errors_are_retried_within_the_task() {
    let h = harness();
    h.physical.inject_infra_failures(2);

    let graph = linear_graph("d1", vec![bring_up_payload()]);
    let (state, _) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::Success);
    assert_eq!(h.physical.executed_statements().len(), 1);
}

/// 补偿动作失败把作业冻结在 `RollbackFailed`，绝不自动重试
#[tokio::test]
async fn test_rollback_failure_freezes_the_job() {
    let h = harness();
    h.physical.fail_statements_containing("FAIL_MARKER");

    let graph = linear_graph(
        "d1",
        vec![
            // 正向语句正常，补偿语句会命中失败标记
            physical_payload(
                "CREATE TABLE IF NOT EXISTS {table}",
                Some("DROP TABLE FAIL_MARKER {table}"),
                true,
            ),
            physical_payload("ALTER TABLE FAIL_MARKER {table}", None, true),
        ],
    );
    let (state, graph) = run_graph(&h, graph).await;

    assert_eq!(state, JobState::RollbackFailed);
    assert_eq!(graph.tasks[&1].state, TaskState::RollbackFailed);
    let stored = h.repository.get_job(graph.job_id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::RollbackFailed);
    assert!(stored.error_message.is_some());
}

/// 模拟崩溃后恢复：重放幂等任务，终态与不间断执行一致
#[tokio::test]
async fn test_crash_resume_reaches_same_terminal_state() {
    // 参照组：不间断执行
    let uninterrupted = harness();
    uninterrupted
        .meta
        .register_table_group("d1", "tg_orders", BTreeMap::new());
    let graph = linear_graph(
        "d1",
        vec![validate_payload(), add_meta_payload("tg_orders"), bring_up_payload()],
    );
    let (reference_state, reference_graph) = run_graph(&uninterrupted, graph).await;
    assert_eq!(reference_state, JobState::Success);

    // 崩溃组：validate已成功、addMeta停在RUNNING（结果未知但幂等）
    let crashed = harness();
    crashed
        .meta
        .register_table_group("d1", "tg_orders", BTreeMap::new());
    let mut graph = linear_graph(
        "d1",
        vec![validate_payload(), add_meta_payload("tg_orders"), bring_up_payload()],
    );
    crashed.repository.create_job(&mut graph).await.unwrap();
    crashed
        .repository
        .update_job_state(graph.job_id, JobState::Running, None)
        .await
        .unwrap();
    {
        let task = graph.task_mut(1).unwrap();
        task.mark(TaskState::Success);
        let snapshot = task.clone();
        crashed.repository.update_task(&snapshot).await.unwrap();
    }
    {
        let task = graph.task_mut(2).unwrap();
        task.mark(TaskState::Running);
        let snapshot = task.clone();
        crashed.repository.update_task(&snapshot).await.unwrap();
    }

    let engine = DdlEngine::new(crashed.ctx.clone());
    let recovery = StartupRecoveryService::new(engine, None);
    let report = recovery.recover_system_state().await.unwrap();

    assert_eq!(report.resumed_jobs, vec![(graph.job_id, JobState::Success)]);
    assert!(report.parked_jobs.is_empty());

    let recovered = crashed
        .repository
        .get_job(graph.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.state, reference_state);
    for (task_id, reference_task) in &reference_graph.tasks {
        assert_eq!(recovered.tasks[task_id].state, reference_task.state);
    }
}

/// 结果未知且不可重放的任务让作业停放等待人工处理
#[tokio::test]
async fn test_recovery_parks_non_idempotent_unknown_outcome() {
    let h = harness();

    let mut graph = linear_graph(
        "d1",
        vec![physical_payload("ALTER TABLE {table} ADD COLUMN c1 INT", None, false)],
    );
    h.repository.create_job(&mut graph).await.unwrap();
    h.repository
        .update_job_state(graph.job_id, JobState::Running, None)
        .await
        .unwrap();
    {
        let task = graph.task_mut(1).unwrap();
        task.mark(TaskState::Running);
        let snapshot = task.clone();
        h.repository.update_task(&snapshot).await.unwrap();
    }

    let engine = DdlEngine::new(h.ctx.clone());
    let recovery = StartupRecoveryService::new(engine, Some(RecoveryConfig::default()));
    let report = recovery.recover_system_state().await.unwrap();

    assert_eq!(report.parked_jobs, vec![graph.job_id]);
    assert!(report.resumed_jobs.is_empty());

    let parked = h.repository.get_job(graph.job_id).await.unwrap().unwrap();
    assert_eq!(parked.state, JobState::Paused);
    assert!(parked.error_message.as_deref().unwrap().contains("人工确认"));
    // 停放的作业仍持有资源预约
    assert_eq!(h.ctx.admission.active_count(), 1);
}
