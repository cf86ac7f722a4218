//! 跨进程重启的端到端测试：SQLite持久化 + 引擎恢复
//!
//! 两个阶段分别构造独立的引擎实例（各自的准入门与协作方），共享同
//! 一个SQLite文件，模拟进程崩溃重启后的恢复路径。

use std::collections::BTreeMap;
use std::sync::Arc;

use ddl_core::ExecutorConfig;
use ddl_domain::{DdlRequest, JobState, TableVisibility, TaskState};
use ddl_executor::{DdlEngine, EngineContext, StartupRecoveryService};
use ddl_infrastructure::{InMemoryMetaStore, SqliteJobRepository};
use ddl_testing_utils::{split_prepared, CountingPhysicalExecutor, RecordingChangeLogSink};

struct Stack {
    engine: Arc<DdlEngine>,
    physical: Arc<CountingPhysicalExecutor>,
}

async fn boot_stack(db_url: &str) -> Stack {
    let repository = Arc::new(SqliteJobRepository::connect(db_url).await.unwrap());
    let meta = InMemoryMetaStore::new();
    meta.register_table_group(
        "d1",
        "tg_orders",
        BTreeMap::from([("orders".to_string(), 1)]),
    );
    let physical = Arc::new(CountingPhysicalExecutor::new());
    let config = ExecutorConfig {
        infra_retry_base_ms: 1,
        ..ExecutorConfig::default()
    };
    let ctx = EngineContext::new(
        repository,
        Arc::new(meta),
        physical.clone(),
        Arc::new(RecordingChangeLogSink::new()),
        config,
    );
    Stack {
        engine: DdlEngine::new(ctx),
        physical,
    }
}

#[tokio::test]
async fn test_paused_job_survives_restart_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}/ddl_jobs.db", dir.path().display());

    // 第一阶段：作业停在发布前的暂停检查点
    let job_id = {
        let stack = boot_stack(&db_url).await;
        let mut prepared = split_prepared("d1");
        prepared.final_visibility = Some(TableVisibility::WriteOnly);
        let outcome = stack
            .engine
            .submit(DdlRequest::SplitPartition(prepared))
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::Paused);
        outcome.job_id
    };

    // 第二阶段：全新进程，恢复后作业保持暂停并重新持有资源
    let stack = boot_stack(&db_url).await;
    let recovery = StartupRecoveryService::new(stack.engine.clone(), None);
    let report = recovery.recover_system_state().await.unwrap();
    assert_eq!(report.paused_jobs, vec![job_id]);
    assert!(report.errors.is_empty());
    assert_eq!(stack.engine.context().admission.active_count(), 1);

    // 操作员恢复后作业收尾
    let outcome = stack.engine.resume(job_id, "dba").await.unwrap();
    assert_eq!(outcome.state, JobState::Success);

    let job = stack.engine.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Success);
    assert!(job.tasks.values().all(|t| t.state == TaskState::Success));
    assert_eq!(stack.engine.context().admission.active_count(), 0);
}

#[tokio::test]
async fn test_paused_job_can_be_rolled_back_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}/ddl_jobs.db", dir.path().display());

    let job_id = {
        let stack = boot_stack(&db_url).await;
        let mut prepared = split_prepared("d1");
        prepared.final_visibility = Some(TableVisibility::WriteOnly);
        let outcome = stack
            .engine
            .submit(DdlRequest::SplitPartition(prepared))
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::Paused);
        outcome.job_id
    };

    let stack = boot_stack(&db_url).await;
    let recovery = StartupRecoveryService::new(stack.engine.clone(), None);
    recovery.recover_system_state().await.unwrap();

    stack.engine.request_rollback(job_id, "dba").await.unwrap();
    let outcome = stack.engine.resume(job_id, "dba").await.unwrap();
    assert_eq!(outcome.state, JobState::RolledBack);

    // staged物理表在重启后的进程里被补偿清理
    let statements = stack.physical.executed_statements();
    assert!(statements
        .iter()
        .any(|s| s.contains("DROP TABLE IF EXISTS orders_p1a")));
    assert!(statements
        .iter()
        .any(|s| s.contains("DROP TABLE IF EXISTS orders_p1b")));

    let job = stack.engine.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(stack.engine.context().admission.active_count(), 0);
}
