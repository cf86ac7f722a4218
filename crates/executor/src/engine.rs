//! 引擎门面
//!
//! 操作入口的控制流：构建作业图 -> 准入 -> 持久化 -> 执行到终态。
//! 暂停的作业保留其资源预约，终态作业释放预约并归档。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{DdlRequest, JobGraph, JobState, OperatorAction};

use crate::context::EngineContext;
use crate::dag_executor::DagExecutor;
use crate::factory;

/// 作业终态（或暂停点）的汇报
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: i64,
    pub state: JobState,
    pub error_message: Option<String>,
}

pub struct DdlEngine {
    ctx: Arc<EngineContext>,
    /// 作业 -> 资源预约凭据，暂停的作业保留预约
    tickets: Mutex<HashMap<i64, u64>>,
}

impl DdlEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tickets: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// 受理一次DDL请求并同步执行到终态（或暂停点）
    pub async fn submit(&self, request: DdlRequest) -> DdlResult<JobOutcome> {
        info!("受理DDL请求: {}", request.description());
        let mut graph = factory::build_job(&request, &self.ctx.config)?;

        let ticket = self
            .ctx
            .admission
            .admit(&graph.schema_name, &graph.excluded_resources)?;
        if let Err(e) = self.ctx.repository.create_job(&mut graph).await {
            self.ctx.admission.release(ticket);
            return Err(e);
        }
        self.tickets.lock().unwrap().insert(graph.job_id, ticket);

        self.drive(graph, ticket).await
    }

    /// 恢复一个暂停（或待回滚）的作业
    pub async fn resume(&self, job_id: i64, requester: &str) -> DdlResult<JobOutcome> {
        let job = self
            .ctx
            .repository
            .get_job(job_id)
            .await?
            .ok_or(DdlEngineError::JobNotFound { job_id })?;
        if job.state.is_terminal() {
            return Err(DdlEngineError::IllegalJobState(format!(
                "作业 {job_id} 已处于终态 {}",
                job.state.as_str()
            )));
        }
        // 留下审计痕迹；调度器启动后会消费所有未决指令
        self.ctx
            .repository
            .append_command(job_id, OperatorAction::Resume, requester)
            .await?;
        info!("操作员 {} 恢复作业 {}", requester, job_id);

        let ticket = self.ticket_for(&job)?;
        self.drive(job, ticket).await
    }

    /// 请求暂停：由运行中的调度器在下一个调度点执行
    pub async fn pause(&self, job_id: i64, requester: &str) -> DdlResult<i64> {
        self.ctx
            .repository
            .append_command(job_id, OperatorAction::Pause, requester)
            .await
    }

    /// 请求跳过一个尚未执行的任务
    pub async fn skip_task(&self, job_id: i64, task_id: i64, requester: &str) -> DdlResult<i64> {
        self.ctx
            .repository
            .append_command(job_id, OperatorAction::SkipTask { task_id }, requester)
            .await
    }

    /// 请求回滚：运行中的作业在下一个调度点进入回滚；
    /// 暂停中的作业需要随后 `resume` 来驱动回滚执行
    pub async fn request_rollback(&self, job_id: i64, requester: &str) -> DdlResult<i64> {
        self.ctx
            .repository
            .append_command(job_id, OperatorAction::Rollback, requester)
            .await
    }

    pub async fn job(&self, job_id: i64) -> DdlResult<Option<JobGraph>> {
        self.ctx.repository.get_job(job_id).await
    }

    /// 崩溃恢复路径：继续驱动一个从存储装载的作业
    pub(crate) async fn resume_loaded(&self, job: JobGraph) -> DdlResult<JobOutcome> {
        let ticket = self.ticket_for(&job)?;
        self.drive(job, ticket).await
    }

    /// 只为作业重建资源预约（暂停作业在恢复进程后仍需持有资源）
    pub(crate) fn reserve_only(&self, job: &JobGraph) -> DdlResult<()> {
        let mut tickets = self.tickets.lock().unwrap();
        if tickets.contains_key(&job.job_id) {
            return Ok(());
        }
        let ticket = self
            .ctx
            .admission
            .admit(&job.schema_name, &job.excluded_resources)?;
        tickets.insert(job.job_id, ticket);
        Ok(())
    }

    fn ticket_for(&self, job: &JobGraph) -> DdlResult<u64> {
        let mut tickets = self.tickets.lock().unwrap();
        if let Some(ticket) = tickets.get(&job.job_id) {
            return Ok(*ticket);
        }
        let ticket = self
            .ctx
            .admission
            .admit(&job.schema_name, &job.excluded_resources)?;
        tickets.insert(job.job_id, ticket);
        Ok(ticket)
    }

    async fn drive(&self, mut graph: JobGraph, ticket: u64) -> DdlResult<JobOutcome> {
        let job_id = graph.job_id;
        let executor = DagExecutor::new(self.ctx.clone());
        let result = executor.execute(&mut graph, ticket).await;

        let release = match &result {
            Ok(state) => state.is_terminal(),
            Err(_) => true,
        };
        if release {
            self.ctx.admission.release(ticket);
            self.tickets.lock().unwrap().remove(&job_id);
        }

        let state = result?;
        Ok(JobOutcome {
            job_id,
            state,
            error_message: graph.error_message.clone(),
        })
    }
}
