use thiserror::Error;

/// DDL引擎统一错误类型定义
#[derive(Debug, Error)]
pub enum DdlEngineError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("作业未找到: {job_id}")]
    JobNotFound { job_id: i64 },

    #[error("任务未找到: 作业 {job_id} 任务 {task_id}")]
    TaskNotFound { job_id: i64, task_id: i64 },

    #[error("作业图不合法: {0}")]
    InvalidGraph(String),

    #[error("前置校验失败: {0}")]
    Validation(String),

    #[error("任务执行失败 (任务 {task_id}): {message}")]
    TaskExecution { task_id: i64, message: String },

    #[error("任务回滚失败 (任务 {task_id}): {message}，作业已冻结，需要人工介入")]
    RollbackFailed { task_id: i64, message: String },

    #[error("基础设施错误: {0}")]
    Infrastructure(String),

    #[error("排除资源冲突: {0}")]
    ResourceConflict(String),

    #[error("作业状态不允许该操作: {0}")]
    IllegalJobState(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DdlEngineError {
    /// 是否属于可本地重试的基础设施错误（超时、连接中断等）
    pub fn is_retryable(&self) -> bool {
        matches!(self, DdlEngineError::Infrastructure(_))
    }
}

/// 统一的Result类型
pub type DdlResult<T> = std::result::Result<T, DdlEngineError>;
