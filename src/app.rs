use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use ddl_core::EngineConfig;
use ddl_domain::JobRepository;
use ddl_executor::{DdlEngine, EngineContext, StartupRecoveryService};
use ddl_infrastructure::{
    InMemoryJobRepository, InMemoryMetaStore, SqliteJobRepository, TracingChangeLogSink,
    TracingPhysicalExecutor,
};

/// 引擎装配
///
/// 作业存储按配置选择SQLite或进程内实现；元数据存储、物理执行器与
/// 变更通知在独立进程模式下使用内置实现，由宿主服务嵌入时注入真实
/// 协作方。
pub struct Application {
    engine: Arc<DdlEngine>,
}

impl Application {
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let repository: Arc<dyn JobRepository> = if config.database.url == "memory" {
            info!("使用进程内作业存储");
            Arc::new(InMemoryJobRepository::new())
        } else {
            info!("使用SQLite作业存储: {}", config.database.url);
            Arc::new(
                SqliteJobRepository::connect(&config.database.url)
                    .await
                    .with_context(|| format!("连接作业存储失败: {}", config.database.url))?,
            )
        };

        let ctx = EngineContext::new(
            repository,
            Arc::new(InMemoryMetaStore::new()),
            Arc::new(TracingPhysicalExecutor),
            Arc::new(TracingChangeLogSink),
            config.executor.clone(),
        );

        Ok(Self {
            engine: DdlEngine::new(ctx),
        })
    }

    /// 启动引擎：先做崩溃恢复，然后等待关闭信号
    pub async fn run(&self) -> Result<()> {
        let recovery = StartupRecoveryService::new(self.engine.clone(), None);
        let report = recovery.recover_system_state().await?;
        if !report.errors.is_empty() {
            warn!("崩溃恢复存在失败项: {:?}", report.errors);
        }

        wait_for_shutdown_signal().await;
        info!("收到关闭信号，DDL作业编排引擎退出");
        Ok(())
    }

    pub async fn show_job(&self, job_id: i64) -> Result<()> {
        match self.engine.job(job_id).await? {
            Some(job) => {
                println!("{}", job.entity_description());
                if let Some(message) = &job.error_message {
                    println!("  信息: {message}");
                }
                for task in job.tasks.values() {
                    println!(
                        "  [{}] {} {}{}",
                        task.state.as_str(),
                        task.id,
                        task.kind(),
                        task.remark()
                    );
                    if let Some(message) = &task.message {
                        println!("      {message}");
                    }
                }
            }
            None => println!("作业 {job_id} 不存在"),
        }
        Ok(())
    }

    pub async fn pause_job(&self, job_id: i64) -> Result<()> {
        self.engine.pause(job_id, &operator_name()).await?;
        println!("已向作业 {job_id} 追加暂停指令");
        Ok(())
    }

    pub async fn resume_job(&self, job_id: i64) -> Result<()> {
        let outcome = self.engine.resume(job_id, &operator_name()).await?;
        println!("作业 {} 当前状态: {}", outcome.job_id, outcome.state.as_str());
        Ok(())
    }

    pub async fn skip_task(&self, job_id: i64, task_id: i64) -> Result<()> {
        self.engine
            .skip_task(job_id, task_id, &operator_name())
            .await?;
        println!("已向作业 {job_id} 追加跳过任务 {task_id} 的指令");
        Ok(())
    }

    pub async fn rollback_job(&self, job_id: i64) -> Result<()> {
        self.engine.request_rollback(job_id, &operator_name()).await?;
        println!("已向作业 {job_id} 追加回滚指令");
        Ok(())
    }
}

fn operator_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
