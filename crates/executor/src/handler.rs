//! 任务执行/回滚逻辑
//!
//! 所有任务种类共享同一个事务边界模板：
//! 1. 事务前置动作：无正确性要求的物理副作用（面向分片的物理语句）；
//! 2. 事务内动作：对元数据存储的状态变更，随 `commit` 原子生效；
//! 3. 成功后置动作：尽力而为的通知，不在事务边界内。
//!
//! 模板只在这里实现一次，各任务种类以载荷变体的身份复用它，
//! 不派生任何任务类层次。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{
    BackfillSpec, DdlTask, DropPhysicalTablesSpec, MetaWrite, SubJobSpec, SyncNotifySpec,
    TaskPayload, UpdateVisibilitySpec, ValidateSpec,
};

use crate::context::EngineContext;
use crate::retry::with_infra_retry;
use crate::subjob;

/// 任务执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// 暂停检查点：调度器停在此节点等待操作员恢复
    Paused,
}

/// 正在执行的作业的上下文信息，随任务下发
#[derive(Debug, Clone)]
pub struct JobScope {
    pub job_id: i64,
    pub schema_name: String,
    /// 准入门颁发的资源预约凭据
    pub ticket: u64,
    pub excluded_resources: BTreeSet<String>,
}

#[derive(Clone)]
pub struct TaskHandler {
    ctx: Arc<EngineContext>,
}

impl TaskHandler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// 执行一个任务；任何错误都会携带完整上下文记录日志后
    /// 归一为该任务的失败原因
    pub async fn execute(&self, scope: &JobScope, task: &DdlTask) -> DdlResult<TaskOutcome> {
        debug!("开始执行{}", task.entity_description());
        match self.execute_payload(scope, task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    "任务执行失败: 作业 {}, 任务 {}, 种类 {}, 备注 {}: {}",
                    scope.job_id,
                    task.id,
                    task.kind(),
                    task.remark(),
                    e
                );
                Err(DdlEngineError::TaskExecution {
                    task_id: task.id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// 回滚一个已成功的任务（幂等补偿动作）
    pub async fn rollback(&self, scope: &JobScope, task: &DdlTask) -> DdlResult<()> {
        debug!("开始回滚{}", task.entity_description());
        match self.rollback_payload(scope, task).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    "任务回滚失败: 作业 {}, 任务 {}, 种类 {}: {}",
                    scope.job_id,
                    task.id,
                    task.kind(),
                    e
                );
                Err(DdlEngineError::RollbackFailed {
                    task_id: task.id,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn execute_payload(&self, scope: &JobScope, task: &DdlTask) -> DdlResult<TaskOutcome> {
        match &task.payload {
            TaskPayload::Empty => Ok(TaskOutcome::Completed),
            TaskPayload::Pause => {
                info!("作业 {} 到达暂停检查点，等待操作员恢复", scope.job_id);
                Ok(TaskOutcome::Paused)
            }
            TaskPayload::Validate(spec) => {
                self.execute_validate(task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::AddMeta(spec) => {
                self.commit_meta_writes(task, &[MetaWrite::AddMeta(spec.clone())])
                    .await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::UpdateVisibility(spec) => {
                self.execute_update_visibility(task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::PhysicalDdl(spec) => {
                self.run_physical_statements(task, &spec.topology, &spec.statement)
                    .await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::Backfill(spec) => {
                self.execute_backfill(task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::DropPhysicalTables(spec) => {
                self.execute_drop_physical_tables(task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::SyncNotify(spec) => {
                self.execute_sync_notify(task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskPayload::SubJob(spec) => {
                self.execute_sub_job(scope, task, spec).await?;
                Ok(TaskOutcome::Completed)
            }
        }
    }

    async fn rollback_payload(&self, _scope: &JobScope, task: &DdlTask) -> DdlResult<()> {
        match &task.payload {
            // 无持久副作用，回滚即空操作
            TaskPayload::Empty
            | TaskPayload::Validate(_)
            | TaskPayload::Pause
            | TaskPayload::SyncNotify(_) => Ok(()),
            TaskPayload::AddMeta(spec) => {
                self.commit_meta_writes(task, &[MetaWrite::RemoveMeta(spec.clone())])
                    .await
            }
            TaskPayload::UpdateVisibility(spec) => {
                self.commit_meta_writes(
                    task,
                    &[MetaWrite::SetVisibility {
                        object_name: spec.object_name.clone(),
                        target: spec.previous,
                    }],
                )
                .await
            }
            TaskPayload::PhysicalDdl(spec) => match &spec.compensating_statement {
                Some(statement) => {
                    self.run_physical_statements(task, &spec.topology, statement)
                        .await
                }
                None => Err(DdlEngineError::Internal(
                    "物理DDL缺少补偿语句，无法回滚".to_string(),
                )),
            },
            TaskPayload::Backfill(spec) => {
                let purged = with_infra_retry(&self.ctx.config, "purge_rows", || {
                    self.ctx.physical.purge_rows(
                        &task.schema_name,
                        &spec.table_name,
                        &spec.target_partitions,
                    )
                })
                .await?;
                info!(
                    "回填补偿完成: 表 {}, 清除 {} 行",
                    spec.table_name, purged
                );
                Ok(())
            }
            TaskPayload::DropPhysicalTables(_) | TaskPayload::SubJob(_) => Err(
                DdlEngineError::Internal(format!("任务种类 {} 不可回滚", task.kind())),
            ),
        }
    }

    async fn execute_validate(&self, task: &DdlTask, spec: &ValidateSpec) -> DdlResult<()> {
        match spec {
            ValidateSpec::TableGroupVersion {
                table_group,
                tables_version,
            } => {
                let current = self
                    .ctx
                    .meta
                    .tables_version(&task.schema_name, table_group)
                    .await?
                    .ok_or_else(|| {
                        DdlEngineError::Validation(format!("表组 {table_group} 不存在"))
                    })?;
                for (table, expected) in tables_version {
                    match current.get(table) {
                        Some(actual) if actual == expected => {}
                        Some(actual) => {
                            return Err(DdlEngineError::Validation(format!(
                                "表 {table} 存在版本偏斜: 预期 {expected}, 实际 {actual}"
                            )));
                        }
                        None => {
                            return Err(DdlEngineError::Validation(format!(
                                "表 {table} 不在表组 {table_group} 中"
                            )));
                        }
                    }
                }
                Ok(())
            }
            ValidateSpec::TableGroupEmpty { table_group } => {
                let count = self
                    .ctx
                    .meta
                    .table_group_member_count(&task.schema_name, table_group)
                    .await?
                    .ok_or_else(|| {
                        DdlEngineError::Validation(format!("表组 {table_group} 不存在"))
                    })?;
                if count != 0 {
                    return Err(DdlEngineError::Validation(format!(
                        "表组 {table_group} 仍有 {count} 张成员表"
                    )));
                }
                Ok(())
            }
            ValidateSpec::PhysicalGroupsAvailable { groups } => {
                for group in groups {
                    if !self
                        .ctx
                        .meta
                        .physical_group_exists(&task.schema_name, group)
                        .await?
                    {
                        return Err(DdlEngineError::Validation(format!(
                            "物理分组 {group} 不可用"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    async fn execute_update_visibility(
        &self,
        task: &DdlTask,
        spec: &UpdateVisibilitySpec,
    ) -> DdlResult<()> {
        self.commit_meta_writes(
            task,
            &[MetaWrite::SetVisibility {
                object_name: spec.object_name.clone(),
                target: spec.target,
            }],
        )
        .await?;
        info!(
            "对象 {}.{} 可见性: {} -> {}",
            task.schema_name,
            spec.object_name,
            spec.previous.as_str(),
            spec.target.as_str()
        );
        Ok(())
    }

    /// 把语句模板按拓扑展开到每张物理表上执行（事务前置动作）
    async fn run_physical_statements(
        &self,
        task: &DdlTask,
        topology: &std::collections::BTreeMap<String, Vec<String>>,
        statement_template: &str,
    ) -> DdlResult<()> {
        for (phy_group, phy_tables) in topology {
            for phy_table in phy_tables {
                let statement = statement_template.replace("{table}", phy_table);
                with_infra_retry(&self.ctx.config, "execute_statement", || {
                    self.ctx.physical.execute_statement(
                        &task.schema_name,
                        phy_group,
                        phy_table,
                        &statement,
                    )
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn execute_backfill(&self, task: &DdlTask, spec: &BackfillSpec) -> DdlResult<()> {
        let rows = with_infra_retry(&self.ctx.config, "copy_rows", || {
            self.ctx.physical.copy_rows(&task.schema_name, spec)
        })
        .await?;
        info!(
            "回填完成: 表 {}, {:?} -> {:?}, 共 {} 行",
            spec.table_name, spec.source_partitions, spec.target_partitions, rows
        );
        Ok(())
    }

    async fn execute_drop_physical_tables(
        &self,
        task: &DdlTask,
        spec: &DropPhysicalTablesSpec,
    ) -> DdlResult<()> {
        self.run_physical_statements(task, &spec.topology, "DROP TABLE IF EXISTS {table}")
            .await
    }

    /// 变更通知：fire-and-forget，带自身的重试策略，不参与作业回滚
    async fn execute_sync_notify(&self, task: &DdlTask, spec: &SyncNotifySpec) -> DdlResult<()> {
        let attempts = self.ctx.config.sync_notify_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .ctx
                .changelog
                .mark_ddl(&task.schema_name, &spec.object_name, &spec.mark)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "变更通知第 {}/{} 次尝试失败 (对象 {}): {}",
                        attempt, attempts, spec.object_name, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(
                            self.ctx.config.infra_retry_base_ms,
                        ))
                        .await;
                    }
                }
            }
        }
        // 通知不属于作业的事务边界，送达失败不阻塞作业
        warn!(
            "变更通知在 {} 次尝试后仍未送达，按fire-and-forget语义继续 (对象 {})",
            attempts, spec.object_name
        );
        Ok(())
    }

    async fn execute_sub_job(
        &self,
        scope: &JobScope,
        task: &DdlTask,
        spec: &SubJobSpec,
    ) -> DdlResult<()> {
        // 子作业会再次进入调度器，这里用Box切断递归的future类型
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = DdlResult<()>> + Send + '_>> =
            Box::pin(subjob::run(self.ctx.clone(), scope, task, spec));
        fut.await
    }

    /// 事务内动作：所有元数据写入在一个事务内原子生效
    async fn commit_meta_writes(&self, task: &DdlTask, writes: &[MetaWrite]) -> DdlResult<()> {
        let mut txn = self.ctx.meta.begin().await?;
        for write in writes {
            if let Err(e) = txn.apply(&task.schema_name, write).await {
                txn.abort().await.ok();
                return Err(e);
            }
        }
        txn.commit().await
    }
}
