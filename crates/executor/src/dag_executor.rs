//! DAG调度器
//!
//! 一张作业图由且仅由一个 `DagExecutor` 实例驱动：先整体落盘，再按
//! 依赖边推进就绪集，受 `max_parallelism` 约束并发派发；任一任务失败
//! 后停止派发、排空在途任务，按逆拓扑序逐个回滚已成功的任务。
//! 任务状态的持久化先于其后继变为可调度（happens-before）。

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{JobGraph, JobState, OperatorAction, TaskState};

use crate::context::EngineContext;
use crate::handler::{JobScope, TaskHandler, TaskOutcome};

pub struct DagExecutor {
    ctx: Arc<EngineContext>,
    handler: TaskHandler,
}

impl DagExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let handler = TaskHandler::new(ctx.clone());
        Self { ctx, handler }
    }

    /// 把作业图驱动到下一个稳定状态（终态或暂停）
    ///
    /// `ticket` 是准入门为本作业颁发的资源预约凭据，调用方负责在
    /// 作业达到终态后释放。
    pub async fn execute(&self, job: &mut JobGraph, ticket: u64) -> DdlResult<JobState> {
        job.validate()?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }

        let scope = JobScope {
            job_id: job.job_id,
            schema_name: job.schema_name.clone(),
            ticket,
            excluded_resources: job.excluded_resources.clone(),
        };

        // 崩溃恢复路径：上次停在失败或回滚中，直接续作回滚
        if matches!(job.state, JobState::Failed | JobState::RollingBack) {
            return self.rollback(job, &scope, None).await;
        }

        info!("开始调度{}", job.entity_description());
        self.transition_job(job, JobState::Running, None).await?;

        let mut join_set: JoinSet<(i64, DdlResult<TaskOutcome>)> = JoinSet::new();
        let mut in_flight: HashSet<i64> = HashSet::new();
        let mut skip_requests: HashSet<i64> = HashSet::new();
        let mut pause_requested = false;
        let mut rollback_requested = false;
        let mut failure: Option<(i64, String)> = None;

        loop {
            // 每个调度点观察一次操作员指令
            for command in self.ctx.repository.take_pending_commands(job.job_id).await? {
                match command.action {
                    OperatorAction::Pause => {
                        info!("作业 {} 收到暂停指令 (来自 {})", job.job_id, command.requester);
                        pause_requested = true;
                    }
                    OperatorAction::Resume => {
                        // 运行中的作业无需恢复
                    }
                    OperatorAction::SkipTask { task_id } => {
                        info!(
                            "作业 {} 收到跳过任务 {} 的指令 (来自 {})",
                            job.job_id, task_id, command.requester
                        );
                        skip_requests.insert(task_id);
                    }
                    OperatorAction::Rollback => {
                        warn!("作业 {} 收到回滚指令 (来自 {})", job.job_id, command.requester);
                        rollback_requested = true;
                    }
                }
            }

            let halted = pause_requested || rollback_requested || failure.is_some();
            if !halted {
                // 先处理跳过请求：待执行任务直接标记为空成功
                for task_id in job.runnable_tasks() {
                    if skip_requests.remove(&task_id) {
                        let snapshot = {
                            let task = job.task_mut(task_id)?;
                            task.mark(TaskState::Success);
                            task.message = Some("由操作员跳过执行".to_string());
                            task.clone()
                        };
                        self.ctx.repository.update_task(&snapshot).await?;
                        info!("任务 {} 已按指令跳过", task_id);
                    }
                }

                // 派发就绪任务，受并行度上限约束
                for task_id in job.runnable_tasks() {
                    if in_flight.len() >= job.max_parallelism.max(1) {
                        break;
                    }
                    let snapshot = {
                        let task = job.task_mut(task_id)?;
                        task.mark(TaskState::Ready);
                        task.mark(TaskState::Running);
                        task.clone()
                    };
                    self.ctx.repository.update_task(&snapshot).await?;
                    in_flight.insert(task_id);

                    let handler = self.handler.clone();
                    let task_scope = scope.clone();
                    join_set.spawn(async move {
                        let result = AssertUnwindSafe(handler.execute(&task_scope, &snapshot))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(DdlEngineError::Internal("任务执行发生panic".to_string()))
                            });
                        (snapshot.id, result)
                    });
                    debug!("已派发任务 {} (在途 {})", task_id, in_flight.len());
                }
            }

            if in_flight.is_empty() {
                if failure.is_some() || rollback_requested {
                    return self.rollback(job, &scope, failure).await;
                }
                if pause_requested {
                    self.transition_job(job, JobState::Paused, None).await?;
                    info!("作业 {} 已暂停，等待操作员恢复", job.job_id);
                    return Ok(JobState::Paused);
                }
                if job.all_success() {
                    self.transition_job(job, JobState::Success, None).await?;
                    info!("作业 {} 执行成功", job.job_id);
                    return Ok(JobState::Success);
                }
                // 图已通过结构校验，这里意味着状态被外部破坏
                return Err(DdlEngineError::Internal(format!(
                    "作业 {} 调度停滞: 无在途任务也无可调度任务",
                    job.job_id
                )));
            }

            // 等待任意一个在途任务落定
            match join_set.join_next().await {
                Some(Ok((task_id, result))) => {
                    in_flight.remove(&task_id);
                    match result {
                        Ok(TaskOutcome::Completed) => {
                            let snapshot = {
                                let task = job.task_mut(task_id)?;
                                task.mark(TaskState::Success);
                                task.clone()
                            };
                            self.ctx.repository.update_task(&snapshot).await?;
                            debug!("任务 {} 成功", task_id);
                        }
                        Ok(TaskOutcome::Paused) => {
                            // 检查点通过即成功，恢复后从后继任务继续
                            let snapshot = {
                                let task = job.task_mut(task_id)?;
                                task.mark(TaskState::Success);
                                task.message = Some("暂停检查点".to_string());
                                task.clone()
                            };
                            self.ctx.repository.update_task(&snapshot).await?;
                            pause_requested = true;
                        }
                        Err(e) => {
                            let message = e.to_string();
                            let snapshot = {
                                let task = job.task_mut(task_id)?;
                                task.mark(TaskState::Failed);
                                task.message = Some(message.clone());
                                task.clone()
                            };
                            self.ctx.repository.update_task(&snapshot).await?;
                            if failure.is_none() {
                                failure = Some((task_id, message));
                            }
                        }
                    }
                }
                Some(Err(join_error)) => {
                    error!("任务执行线程异常退出: {}", join_error);
                    return Err(DdlEngineError::Internal(format!(
                        "任务执行线程异常退出: {join_error}"
                    )));
                }
                None => {
                    return Err(DdlEngineError::Internal(
                        "在途任务记账与执行器不一致".to_string(),
                    ));
                }
            }
        }
    }

    /// 回滚：已成功的任务按逆拓扑序逐个补偿，每步落盘；
    /// 任何补偿失败都把作业冻结在 `RollbackFailed`，绝不自动重试
    async fn rollback(
        &self,
        job: &mut JobGraph,
        scope: &JobScope,
        origin: Option<(i64, String)>,
    ) -> DdlResult<JobState> {
        let reason = origin
            .map(|(task_id, message)| format!("任务 {task_id} 失败: {message}"))
            .or_else(|| job.error_message.clone())
            .unwrap_or_else(|| "操作员请求回滚".to_string());
        warn!("作业 {} 开始回滚: {}", job.job_id, reason);
        self.transition_job(job, JobState::RollingBack, Some(&reason))
            .await?;

        for task_id in job.rollback_order()? {
            let task = job.task(task_id)?.clone();
            if !task.is_rollbackable() {
                let message = format!("任务种类 {} 不支持回滚", task.kind());
                self.freeze_rollback(job, task_id, &message).await?;
                return Ok(JobState::RollbackFailed);
            }

            {
                let task = job.task_mut(task_id)?;
                task.mark(TaskState::RollingBack);
                let snapshot = task.clone();
                self.ctx.repository.update_task(&snapshot).await?;
            }

            match self.handler.rollback(scope, &task).await {
                Ok(()) => {
                    let snapshot = {
                        let task = job.task_mut(task_id)?;
                        task.mark(TaskState::RolledBack);
                        task.clone()
                    };
                    self.ctx.repository.update_task(&snapshot).await?;
                    debug!("任务 {} 回滚完成", task_id);
                }
                Err(e) => {
                    self.freeze_rollback(job, task_id, &e.to_string()).await?;
                    return Ok(JobState::RollbackFailed);
                }
            }
        }

        self.transition_job(job, JobState::RolledBack, None).await?;
        warn!("作业 {} 回滚完成", job.job_id);
        Ok(JobState::RolledBack)
    }

    /// 回滚失败是致命的：冻结作业等待人工介入
    async fn freeze_rollback(
        &self,
        job: &mut JobGraph,
        task_id: i64,
        message: &str,
    ) -> DdlResult<()> {
        error!(
            "作业 {} 回滚失败于任务 {}: {}，作业已冻结，需要人工介入",
            job.job_id, task_id, message
        );
        let snapshot = {
            let task = job.task_mut(task_id)?;
            task.mark(TaskState::RollbackFailed);
            task.message = Some(message.to_string());
            task.clone()
        };
        self.ctx.repository.update_task(&snapshot).await?;
        self.transition_job(job, JobState::RollbackFailed, Some(message))
            .await
    }

    async fn transition_job(
        &self,
        job: &mut JobGraph,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()> {
        job.state = state;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        self.ctx
            .repository
            .update_job_state(job.job_id, state, error_message)
            .await
    }
}
