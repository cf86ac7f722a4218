//! 引擎门面的端到端测试：工厂构图 -> 准入 -> 持久化 -> 执行

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use ddl_core::DdlEngineError;
use ddl_domain::{
    CreateGlobalIndexPreparedData, DdlRequest, JobRepository, JobState, MetaStore,
    TableVisibility, TargetGroupPlacement,
};
use ddl_executor::DdlEngine;
use ddl_testing_utils::{split_prepared, CountingPhysicalExecutor};

use common::{harness, harness_with, TestHarness};

fn register_orders_meta(h: &TestHarness) {
    h.meta.register_table_group(
        "d1",
        "tg_orders",
        BTreeMap::from([("orders".to_string(), 1)]),
    );
    h.meta.register_physical_group("d1", "dn0");
    h.meta.register_physical_group("d1", "dn1");
}

#[tokio::test]
async fn test_split_partition_end_to_end() {
    let h = harness();
    register_orders_meta(&h);
    let engine = DdlEngine::new(h.ctx.clone());

    let outcome = engine
        .submit(DdlRequest::SplitPartition(split_prepared("d1")))
        .await
        .unwrap();
    assert_eq!(outcome.state, JobState::Success);

    // staged物理表逐一创建，旧物理表最终清理
    let statements = h.physical.executed_statements();
    assert!(statements
        .iter()
        .any(|s| s.contains("CREATE TABLE IF NOT EXISTS orders_p1a")));
    assert!(statements
        .iter()
        .any(|s| s.contains("CREATE TABLE IF NOT EXISTS orders_p1b")));
    assert!(statements
        .iter()
        .any(|s| s.contains("DROP TABLE IF EXISTS orders_p1")));

    // 回填覆盖两个新分区
    let copied = h.physical.copied_specs();
    assert_eq!(copied.len(), 1);
    assert_eq!(copied[0].target_partitions, vec!["p1a", "p1b"]);

    // 可见性推到Public，变更标记已发出
    assert_eq!(
        h.meta.visibility("d1", "tg_orders").await.unwrap(),
        Some(TableVisibility::Public)
    );
    assert!(h
        .changelog
        .marks()
        .contains(&("tg_orders".to_string(), "DOING_REORG".to_string())));

    // 作业归档为终态，资源预约已释放
    let stored = h
        .repository
        .get_job(outcome.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, JobState::Success);
    assert_eq!(h.ctx.admission.active_count(), 0);
}

/// 排除资源相交的两个作业绝不同时处于运行态
#[tokio::test]
async fn test_overlapping_jobs_are_mutually_exclusive() {
    let h = harness_with(CountingPhysicalExecutor::with_delay_ms(20));
    register_orders_meta(&h);
    let engine = DdlEngine::new(h.ctx.clone());

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit(DdlRequest::SplitPartition(split_prepared("d1")))
                .await
        })
    };

    // 等第一个作业完成准入
    let mut waited = 0;
    while h.ctx.admission.active_count() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        waited += 1;
        assert!(waited < 500, "第一个作业始终未完成准入");
    }

    // 同资源的兄弟作业在准入时被拒绝
    let second = engine
        .submit(DdlRequest::SplitPartition(split_prepared("d1")))
        .await;
    assert!(matches!(second, Err(DdlEngineError::ResourceConflict(_))));

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::Success);

    // 第一个作业结束后资源释放，再次提交成功
    let third = engine
        .submit(DdlRequest::SplitPartition(split_prepared("d1")))
        .await
        .unwrap();
    assert_eq!(third.state, JobState::Success);
}

/// 建新表组的拆分通过两个子作业完成，子作业继承父作业的排除资源
#[tokio::test]
async fn test_split_into_new_table_group_runs_sub_jobs() {
    let h = harness();
    register_orders_meta(&h);
    // 准备层已创建的新表组元数据
    h.meta.register_table_group(
        "d1",
        "tg_new",
        BTreeMap::from([("orders".to_string(), 1)]),
    );
    let engine = DdlEngine::new(h.ctx.clone());

    let mut prepared = split_prepared("d1");
    prepared.placement = TargetGroupPlacement::CreateNewTableGroup {
        new_table_group: "tg_new".to_string(),
    };

    let outcome = engine
        .submit(DdlRequest::SplitPartition(prepared))
        .await
        .unwrap();
    assert_eq!(outcome.state, JobState::Success);

    // 父作业 + 迁组子作业 + 其下的搬迁子作业 + 组内拆分子作业
    let parent = h
        .repository
        .get_job(outcome.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.state, JobState::Success);
    assert!(parent.parent_job_id.is_none());

    let mut child_count = 0;
    for job_id in 1..=h.repository.job_count() as i64 {
        let job = h.repository.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Success);
        if job.parent_job_id.is_some() {
            child_count += 1;
            // 子作业继承了父作业的排除资源
            let parent_job = h
                .repository
                .get_job(job.parent_job_id.unwrap())
                .await
                .unwrap()
                .unwrap();
            assert!(job
                .excluded_resources
                .is_superset(&parent_job.excluded_resources));
        }
    }
    assert_eq!(child_count, 3);
    assert_eq!(h.ctx.admission.active_count(), 0);
}

/// 调试覆盖非Public：发布前停在暂停检查点，恢复后作业收尾
#[tokio::test]
async fn test_pause_before_public_then_resume() {
    let h = harness();
    register_orders_meta(&h);
    let engine = DdlEngine::new(h.ctx.clone());

    let mut prepared = split_prepared("d1");
    prepared.final_visibility = Some(TableVisibility::WriteOnly);

    let outcome = engine
        .submit(DdlRequest::SplitPartition(prepared))
        .await
        .unwrap();
    assert_eq!(outcome.state, JobState::Paused);

    // 可见性阶梯没有执行，旧物理表未清理
    assert_eq!(h.meta.visibility("d1", "tg_orders").await.unwrap(), None);
    assert!(!h
        .physical
        .executed_statements()
        .iter()
        .any(|s| s.starts_with("DROP")));
    // 暂停的作业保留资源预约
    assert_eq!(h.ctx.admission.active_count(), 1);

    let resumed = engine.resume(outcome.job_id, "dba").await.unwrap();
    assert_eq!(resumed.state, JobState::Success);
    assert_eq!(h.ctx.admission.active_count(), 0);
}

/// 暂停中的作业可以被操作员要求回滚：恢复时直接进入回滚
#[tokio::test]
async fn test_rollback_of_paused_job_on_resume() {
    let h = harness();
    register_orders_meta(&h);
    let engine = DdlEngine::new(h.ctx.clone());

    let mut prepared = split_prepared("d1");
    prepared.final_visibility = Some(TableVisibility::WriteOnly);

    let outcome = engine
        .submit(DdlRequest::SplitPartition(prepared))
        .await
        .unwrap();
    assert_eq!(outcome.state, JobState::Paused);

    engine.request_rollback(outcome.job_id, "dba").await.unwrap();
    let resumed = engine.resume(outcome.job_id, "dba").await.unwrap();
    assert_eq!(resumed.state, JobState::RolledBack);

    // 元数据登记被补偿，staged物理表被清理
    let journal = h.meta.journal();
    assert!(journal.contains(&"REMOVE_META d1.tg_orders".to_string()));
    let statements = h.physical.executed_statements();
    assert!(statements
        .iter()
        .any(|s| s.contains("DROP TABLE IF EXISTS orders_p1a")));
    assert_eq!(h.ctx.admission.active_count(), 0);
}

#[tokio::test]
async fn test_create_global_index_end_to_end() {
    let h = harness();
    register_orders_meta(&h);
    let engine = DdlEngine::new(h.ctx.clone());

    let prepared = CreateGlobalIndexPreparedData {
        schema_name: "d1".to_string(),
        table_name: "orders".to_string(),
        table_group: "tg_orders".to_string(),
        index_name: "idx_orders_buyer".to_string(),
        columns: vec!["buyer_id".to_string()],
        index_topology: BTreeMap::from([
            ("dn0".to_string(), vec!["idx_orders_buyer_0".to_string()]),
            ("dn1".to_string(), vec!["idx_orders_buyer_1".to_string()]),
        ]),
        tables_version: BTreeMap::from([("orders".to_string(), 1)]),
        final_visibility: None,
        max_parallelism: None,
    };

    let outcome = engine
        .submit(DdlRequest::CreateGlobalIndex(prepared))
        .await
        .unwrap();
    assert_eq!(outcome.state, JobState::Success);

    assert_eq!(
        h.meta.visibility("d1", "idx_orders_buyer").await.unwrap(),
        Some(TableVisibility::Public)
    );
    assert!(h.meta.registered_meta("d1", "idx_orders_buyer").is_some());
    assert!(h
        .changelog
        .marks()
        .contains(&("idx_orders_buyer".to_string(), "CREATE_GLOBAL_INDEX".to_string())));
    assert_eq!(h.physical.executed_statements().len(), 2);
}

/// 变更通知送达失败不阻塞作业（fire-and-forget语义）
#[tokio::test]
async fn test_sync_notify_exhaustion_does_not_fail_the_job() {
    let h = harness();
    register_orders_meta(&h);
    h.changelog.inject_failures(100);
    let engine = DdlEngine::new(h.ctx.clone());

    let outcome = engine
        .submit(DdlRequest::SplitPartition(split_prepared("d1")))
        .await
        .unwrap();

    assert_eq!(outcome.state, JobState::Success);
    assert!(h.changelog.marks().is_empty());
}

/// 前置校验失败：没有任何副作用，作业干净地终止
#[tokio::test]
async fn test_validation_failure_leaves_no_side_effects() {
    let h = harness();
    // 故意不登记表组元数据
    let engine = DdlEngine::new(h.ctx.clone());

    let outcome = engine
        .submit(DdlRequest::SplitPartition(split_prepared("d1")))
        .await
        .unwrap();

    assert_eq!(outcome.state, JobState::RolledBack);
    assert!(outcome.error_message.as_deref().unwrap().contains("tg_orders"));
    assert!(h.physical.executed_statements().is_empty());
    assert!(h.meta.journal().is_empty());
    assert_eq!(h.ctx.admission.active_count(), 0);
}
