use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 操作员指令
///
/// 追加写入持久化存储，由作业的调度器在下一个调度点观察到并执行。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum OperatorAction {
    /// 暂停作业：排空在途任务后停在安全检查点
    Pause,
    /// 恢复已暂停的作业
    Resume,
    /// 将一个尚未执行的任务标记为空成功，不执行其副作用
    SkipTask { task_id: i64 },
    /// 对运行中的作业发起回滚
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCommand {
    /// 持久化时分配
    pub id: i64,
    pub job_id: i64,
    pub action: OperatorAction,
    pub requester: String,
    /// 用于跨组件关联日志
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

impl OperatorCommand {
    pub fn new(job_id: i64, action: OperatorAction, requester: impl Into<String>) -> Self {
        Self {
            id: 0,
            job_id,
            action,
            requester: requester.into(),
            trace_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            consumed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde_tag() {
        let action = OperatorAction::SkipTask { task_id: 7 };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "SkipTask");
        assert_eq!(json["task_id"], 7);

        let restored: OperatorAction = serde_json::from_value(json).unwrap();
        assert_eq!(restored, action);
    }
}
