//! 子作业运行器
//!
//! `SubJob` 任务在执行时同步构建一张嵌套作业图，经准入门在父作业的
//! 预约之下准入后，交由独立的 `DagExecutor` 实例驱动；父任务阻塞等待
//! 子作业达到终态。子作业继承父作业的排除资源集（并集），因此不会与
//! 父作业的兄弟任务争抢同一物理资源。

use std::sync::Arc;

use tracing::{info, warn};

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{DdlTask, JobState, SubJobSpec};

use crate::context::EngineContext;
use crate::dag_executor::DagExecutor;
use crate::factory;
use crate::handler::JobScope;

pub async fn run(
    ctx: Arc<EngineContext>,
    scope: &JobScope,
    task: &DdlTask,
    spec: &SubJobSpec,
) -> DdlResult<()> {
    info!(
        "任务 {} (作业 {}) 启动子作业: {}",
        task.id,
        scope.job_id,
        spec.request.description()
    );

    let mut child = factory::build_job(&spec.request, &ctx.config)?;
    // 继承父作业的排除资源集，父子不会在同一资源上互斥
    child
        .excluded_resources
        .extend(scope.excluded_resources.iter().cloned());
    child.parent_job_id = Some(scope.job_id);

    let child_ticket = ctx.admission.admit_sub_job(
        scope.ticket,
        &child.schema_name,
        &child.excluded_resources,
        spec.parent_acquire_resource,
    )?;

    let result = run_admitted(&ctx, &mut child, child_ticket).await;
    ctx.admission.release(child_ticket);
    let state = result?;

    match state {
        JobState::Success => {
            info!("子作业 {} 执行成功", child.job_id);
            Ok(())
        }
        JobState::Paused => {
            warn!("子作业 {} 停在暂停状态，父任务按失败处理", child.job_id);
            Err(DdlEngineError::TaskExecution {
                task_id: task.id,
                message: format!("子作业 {} 处于暂停状态，需要人工处理后单独恢复", child.job_id),
            })
        }
        other => Err(DdlEngineError::TaskExecution {
            task_id: task.id,
            message: format!(
                "子作业 {} 终止于 {}: {}",
                child.job_id,
                other.as_str(),
                child.error_message.clone().unwrap_or_default()
            ),
        }),
    }
}

async fn run_admitted(
    ctx: &Arc<EngineContext>,
    child: &mut ddl_domain::JobGraph,
    child_ticket: u64,
) -> DdlResult<JobState> {
    ctx.repository.create_job(child).await?;
    let executor = DagExecutor::new(ctx.clone());
    executor.execute(child, child_ticket).await
}
