//! 启动时的崩溃恢复
//!
//! 进程重启后装载所有未达终态的作业：结果未知（停在RUNNING）的任务
//! 幂等时重置为就绪重放，否则把作业停放到 `Paused` 等待人工确认；
//! 其余作业按其状态续跑或续回滚。暂停中的作业只重建资源预约，
//! 不自动恢复。

use std::sync::Arc;

use tracing::{error, info, warn};

use ddl_core::DdlResult;
use ddl_domain::{JobGraph, JobState, TaskState};

use crate::engine::DdlEngine;

/// 恢复服务配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 是否重放结果未知但幂等的任务（关闭后一律停放人工处理）
    pub reexecute_idempotent_tasks: bool,
    /// 是否自动恢复崩溃前已暂停的作业
    pub resume_paused_jobs: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reexecute_idempotent_tasks: true,
            resume_paused_jobs: false,
        }
    }
}

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// 续跑到稳定状态的作业
    pub resumed_jobs: Vec<(i64, JobState)>,
    /// 停放等待人工处理的作业
    pub parked_jobs: Vec<i64>,
    /// 保持暂停、仅重建资源预约的作业
    pub paused_jobs: Vec<i64>,
    pub errors: Vec<String>,
    pub recovery_duration_ms: u64,
}

pub struct StartupRecoveryService {
    engine: Arc<DdlEngine>,
    config: RecoveryConfig,
}

impl StartupRecoveryService {
    pub fn new(engine: Arc<DdlEngine>, config: Option<RecoveryConfig>) -> Self {
        Self {
            engine,
            config: config.unwrap_or_default(),
        }
    }

    /// 系统启动时恢复作业状态
    pub async fn recover_system_state(&self) -> DdlResult<RecoveryReport> {
        info!("开始崩溃恢复");
        let start_time = std::time::Instant::now();
        let mut report = RecoveryReport::default();

        let jobs = self.engine.context().repository.load_active_jobs().await?;
        info!("发现 {} 个未达终态的作业", jobs.len());

        for job in jobs {
            let job_id = job.job_id;
            match self.recover_job(job, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    let message = format!("恢复作业 {job_id} 失败: {e}");
                    error!("{}", message);
                    report.errors.push(message);
                }
            }
        }

        report.recovery_duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "崩溃恢复完成，耗时 {}ms: 续跑 {} 个，停放 {} 个，保持暂停 {} 个，失败 {} 个",
            report.recovery_duration_ms,
            report.resumed_jobs.len(),
            report.parked_jobs.len(),
            report.paused_jobs.len(),
            report.errors.len()
        );
        Ok(report)
    }

    async fn recover_job(&self, mut job: JobGraph, report: &mut RecoveryReport) -> DdlResult<()> {
        let repository = self.engine.context().repository.clone();

        // 崩溃时停在RUNNING的任务结果未知
        let mut park = false;
        let running_tasks: Vec<i64> = job
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.id)
            .collect();
        for task_id in running_tasks {
            let task = job.task_mut(task_id)?;
            if self.config.reexecute_idempotent_tasks && task.is_idempotent() {
                warn!(
                    "作业 {} 的任务 {} 结果未知，按幂等语义重置为就绪",
                    job.job_id, task_id
                );
                task.mark(TaskState::Ready);
                let snapshot = task.clone();
                repository.update_task(&snapshot).await?;
            } else {
                warn!(
                    "作业 {} 的任务 {} 结果未知且不可重放，停放等待人工确认",
                    job.job_id, task_id
                );
                park = true;
            }
        }

        if park {
            repository
                .update_job_state(
                    job.job_id,
                    JobState::Paused,
                    Some("崩溃恢复发现结果未知且不可重放的任务，需要人工确认后恢复"),
                )
                .await?;
            self.engine.reserve_only(&job)?;
            report.parked_jobs.push(job.job_id);
            return Ok(());
        }

        match job.state {
            JobState::Paused if !self.config.resume_paused_jobs => {
                // 暂停的作业仍持有资源，重建预约后保持原状
                self.engine.reserve_only(&job)?;
                report.paused_jobs.push(job.job_id);
                Ok(())
            }
            _ => {
                let job_id = job.job_id;
                let outcome = self.engine.resume_loaded(job).await?;
                info!(
                    "作业 {} 恢复完成，当前状态 {}",
                    job_id,
                    outcome.state.as_str()
                );
                report.resumed_jobs.push((job_id, outcome.state));
                Ok(())
            }
        }
    }
}
