use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ddl_core::{DdlEngineError, DdlResult};

use crate::task::{DdlTask, TaskState};

/// 作业整体状态机
///
/// `Pending → Running → {Success | Failed | Paused}`；
/// `Failed → RollingBack → {RolledBack | RollbackFailed}`；
/// `Paused` 可以被操作员恢复回 `Running`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ROLLING_BACK")]
    RollingBack,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ROLLED_BACK")]
    RolledBack,
    #[serde(rename = "ROLLBACK_FAILED")]
    RollbackFailed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Failed => "FAILED",
            JobState::RollingBack => "ROLLING_BACK",
            JobState::Success => "SUCCESS",
            JobState::RolledBack => "ROLLED_BACK",
            JobState::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "PAUSED" => Some(JobState::Paused),
            "FAILED" => Some(JobState::Failed),
            "ROLLING_BACK" => Some(JobState::RollingBack),
            "SUCCESS" => Some(JobState::Success),
            "ROLLED_BACK" => Some(JobState::RolledBack),
            "ROLLBACK_FAILED" => Some(JobState::RollbackFailed),
            _ => None,
        }
    }

    /// 终态作业不再被调度；`RollbackFailed` 只能由人工处理
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::RolledBack | JobState::RollbackFailed
        )
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        JobState::parse(s).ok_or_else(|| format!("Invalid job state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// combine 合并后暴露给外部拼接的子图头尾节点
#[derive(Debug, Clone, Copy)]
pub struct CombinedSubGraph {
    pub head: i64,
    pub tail: i64,
}

/// 一次schema变更工作流实例：任务节点 + 有向边构成的DAG
///
/// 不变式：边集无环；任务在其全部前驱 `Success` 之后才可执行；
/// 排除资源集是作业间互斥的唯一依据。
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// 作业ID，持久化时由仓储分配
    pub job_id: i64,
    /// 由子作业机制创建时指向父作业
    pub parent_job_id: Option<i64>,
    pub schema_name: String,
    pub state: JobState,
    pub tasks: BTreeMap<i64, DdlTask>,
    /// (前驱, 后继)
    pub edges: BTreeSet<(i64, i64)>,
    pub labeled_head: Option<i64>,
    pub labeled_tail: Option<i64>,
    /// 本作业运行期间独占的资源名（表组/表/分区）
    pub excluded_resources: BTreeSet<String>,
    pub max_parallelism: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    next_task_id: i64,
}

impl JobGraph {
    pub fn new(schema_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: 0, // 持久化时分配
            parent_job_id: None,
            schema_name: schema_name.into(),
            state: JobState::Pending,
            tasks: BTreeMap::new(),
            edges: BTreeSet::new(),
            labeled_head: None,
            labeled_tail: None,
            excluded_resources: BTreeSet::new(),
            max_parallelism: 1,
            error_message: None,
            created_at: now,
            updated_at: now,
            next_task_id: 1,
        }
    }

    /// 从持久化数据重建作业图
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        job_id: i64,
        parent_job_id: Option<i64>,
        schema_name: String,
        state: JobState,
        tasks: Vec<DdlTask>,
        edges: Vec<(i64, i64)>,
        labeled_head: Option<i64>,
        labeled_tail: Option<i64>,
        excluded_resources: BTreeSet<String>,
        max_parallelism: usize,
        error_message: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let next_task_id = tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        Self {
            job_id,
            parent_job_id,
            schema_name,
            state,
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            edges: edges.into_iter().collect(),
            labeled_head,
            labeled_tail,
            excluded_resources,
            max_parallelism,
            error_message,
            created_at,
            updated_at,
            next_task_id,
        }
    }

    /// 任务入图并分配ID
    pub fn add_task(&mut self, mut task: DdlTask) -> i64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        task.id = id;
        task.job_id = self.job_id;
        self.tasks.insert(id, task);
        id
    }

    /// 添加一条 前驱 -> 后继 边
    pub fn add_task_relationship(&mut self, predecessor: i64, successor: i64) -> DdlResult<()> {
        if !self.tasks.contains_key(&predecessor) {
            return Err(DdlEngineError::TaskNotFound {
                job_id: self.job_id,
                task_id: predecessor,
            });
        }
        if !self.tasks.contains_key(&successor) {
            return Err(DdlEngineError::TaskNotFound {
                job_id: self.job_id,
                task_id: successor,
            });
        }
        if predecessor == successor {
            return Err(DdlEngineError::InvalidGraph(format!(
                "任务 {predecessor} 不能依赖自身"
            )));
        }
        self.edges.insert((predecessor, successor));
        Ok(())
    }

    /// 将一组任务按顺序链接成直线子图，返回分配的任务ID
    pub fn add_sequential_tasks(&mut self, tasks: Vec<DdlTask>) -> DdlResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(self.add_task(task));
        }
        for pair in ids.windows(2) {
            self.add_task_relationship(pair[0], pair[1])?;
        }
        Ok(ids)
    }

    pub fn label_as_head(&mut self, task_id: i64) {
        self.labeled_head = Some(task_id);
    }

    pub fn label_as_tail(&mut self, task_id: i64) {
        self.labeled_tail = Some(task_id);
    }

    /// 合并另一张作业图：节点重新编号、边集/资源集并入，
    /// 返回子图头尾以供外部继续拼接
    pub fn combine(&mut self, child: JobGraph) -> DdlResult<CombinedSubGraph> {
        let child_head = child.single_head()?;
        let child_tail = child.single_tail()?;

        let mut id_map: HashMap<i64, i64> = HashMap::new();
        for (old_id, mut task) in child.tasks {
            task.id = 0;
            let new_id = self.add_task(task);
            id_map.insert(old_id, new_id);
        }
        for (pred, succ) in child.edges {
            self.add_task_relationship(id_map[&pred], id_map[&succ])?;
        }
        self.excluded_resources.extend(child.excluded_resources);

        Ok(CombinedSubGraph {
            head: id_map[&child_head],
            tail: id_map[&child_tail],
        })
    }

    /// 子图用于拼接的头节点：优先取标记值，否则要求唯一入度为0的节点
    fn single_head(&self) -> DdlResult<i64> {
        if let Some(head) = self.labeled_head {
            return Ok(head);
        }
        let heads = self.heads();
        match heads.as_slice() {
            [only] => Ok(*only),
            _ => Err(DdlEngineError::InvalidGraph(format!(
                "子图头节点不唯一: {heads:?}"
            ))),
        }
    }

    fn single_tail(&self) -> DdlResult<i64> {
        if let Some(tail) = self.labeled_tail {
            return Ok(tail);
        }
        let tails = self.tails();
        match tails.as_slice() {
            [only] => Ok(*only),
            _ => Err(DdlEngineError::InvalidGraph(format!(
                "子图尾节点不唯一: {tails:?}"
            ))),
        }
    }

    /// 入度为0的任务
    pub fn heads(&self) -> Vec<i64> {
        self.tasks
            .keys()
            .filter(|id| !self.edges.iter().any(|(_, s)| s == *id))
            .copied()
            .collect()
    }

    /// 出度为0的任务
    pub fn tails(&self) -> Vec<i64> {
        self.tasks
            .keys()
            .filter(|id| !self.edges.iter().any(|(p, _)| p == *id))
            .copied()
            .collect()
    }

    pub fn predecessors(&self, task_id: i64) -> Vec<i64> {
        self.edges
            .iter()
            .filter(|(_, s)| *s == task_id)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn successors(&self, task_id: i64) -> Vec<i64> {
        self.edges
            .iter()
            .filter(|(p, _)| *p == task_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn task(&self, task_id: i64) -> DdlResult<&DdlTask> {
        self.tasks.get(&task_id).ok_or(DdlEngineError::TaskNotFound {
            job_id: self.job_id,
            task_id,
        })
    }

    pub fn task_mut(&mut self, task_id: i64) -> DdlResult<&mut DdlTask> {
        let job_id = self.job_id;
        self.tasks
            .get_mut(&task_id)
            .ok_or(DdlEngineError::TaskNotFound { job_id, task_id })
    }

    /// 结构校验：非空、边端点存在、无环、头尾标记有效
    pub fn validate(&self) -> DdlResult<()> {
        if self.tasks.is_empty() {
            return Err(DdlEngineError::InvalidGraph("作业图不能为空".to_string()));
        }
        for (pred, succ) in &self.edges {
            if !self.tasks.contains_key(pred) || !self.tasks.contains_key(succ) {
                return Err(DdlEngineError::InvalidGraph(format!(
                    "边 ({pred}, {succ}) 引用了不存在的任务"
                )));
            }
        }
        if let Some(head) = self.labeled_head {
            if !self.tasks.contains_key(&head) {
                return Err(DdlEngineError::InvalidGraph(format!(
                    "头标记 {head} 引用了不存在的任务"
                )));
            }
        }
        if let Some(tail) = self.labeled_tail {
            if !self.tasks.contains_key(&tail) {
                return Err(DdlEngineError::InvalidGraph(format!(
                    "尾标记 {tail} 引用了不存在的任务"
                )));
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn拓扑排序；存在环则报错
    pub fn topological_order(&self) -> DdlResult<Vec<i64>> {
        let mut in_degree: HashMap<i64, usize> =
            self.tasks.keys().map(|id| (*id, 0)).collect();
        for (_, succ) in &self.edges {
            *in_degree.entry(*succ).or_insert(0) += 1;
        }

        // 起始节点排序，保证拓扑序确定
        let mut roots: Vec<i64> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort_unstable();
        let mut queue: VecDeque<i64> = roots.into();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for succ in self.successors(id) {
                let degree = in_degree.get_mut(&succ).expect("后继必在图中");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() < self.tasks.len() {
            return Err(DdlEngineError::InvalidGraph(
                "检测到循环依赖".to_string(),
            ));
        }
        Ok(order)
    }

    /// 当前可以调度的任务：未开始且全部前驱已成功
    pub fn runnable_tasks(&self) -> Vec<i64> {
        self.tasks
            .iter()
            .filter(|(id, task)| {
                matches!(task.state, TaskState::Created | TaskState::Ready)
                    && self
                        .predecessors(**id)
                        .iter()
                        .all(|p| self.tasks[p].state == TaskState::Success)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_success(&self) -> bool {
        self.tasks.values().all(|t| t.state == TaskState::Success)
    }

    /// 回滚顺序：已成功（含崩溃时停在回滚中）的任务按逆拓扑序排列，
    /// 后继先于前驱
    pub fn rollback_order(&self) -> DdlResult<Vec<i64>> {
        let mut order: Vec<i64> = self
            .topological_order()?
            .into_iter()
            .filter(|id| {
                matches!(
                    self.tasks[id].state,
                    TaskState::Success | TaskState::RollingBack
                )
            })
            .collect();
        order.reverse();
        Ok(order)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "作业 {} (schema: {}, 任务数: {}, 状态: {})",
            self.job_id,
            self.schema_name,
            self.tasks.len(),
            self.state.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    fn empty_task() -> DdlTask {
        DdlTask::new("d1", TaskPayload::Empty)
    }

    #[test]
    fn test_sequential_tasks_form_a_chain() {
        let mut graph = JobGraph::new("d1");
        let ids = graph
            .add_sequential_tasks(vec![empty_task(), empty_task(), empty_task()])
            .unwrap();

        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(graph.heads(), vec![1]);
        assert_eq!(graph.tails(), vec![3]);
        assert_eq!(graph.predecessors(2), vec![1]);
        assert_eq!(graph.successors(2), vec![3]);
        graph.validate().unwrap();
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = JobGraph::new("d1");
        let a = graph.add_task(empty_task());
        let b = graph.add_task(empty_task());
        graph.add_task_relationship(a, b).unwrap();
        graph.add_task_relationship(b, a).unwrap();

        assert!(matches!(
            graph.validate(),
            Err(DdlEngineError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_self_edge_is_rejected() {
        let mut graph = JobGraph::new("d1");
        let a = graph.add_task(empty_task());
        assert!(graph.add_task_relationship(a, a).is_err());
    }

    #[test]
    fn test_combine_remaps_child_ids_and_merges_resources() {
        let mut parent = JobGraph::new("d1");
        let p1 = parent.add_task(empty_task());
        let p2 = parent.add_task(empty_task());
        parent.add_task_relationship(p1, p2).unwrap();
        parent.excluded_resources.insert("tg1".to_string());

        let mut child = JobGraph::new("d1");
        let c1 = child.add_task(empty_task());
        let c2 = child.add_task(empty_task());
        child.add_task_relationship(c1, c2).unwrap();
        child.label_as_head(c1);
        child.label_as_tail(c2);
        child.excluded_resources.insert("tg2".to_string());

        let stitched = parent.combine(child).unwrap();
        parent.add_task_relationship(p2, stitched.head).unwrap();

        assert_eq!(parent.tasks.len(), 4);
        assert!(stitched.head > p2);
        assert!(parent.excluded_resources.contains("tg1"));
        assert!(parent.excluded_resources.contains("tg2"));
        parent.validate().unwrap();
        // 合并后的图保持一条链
        assert_eq!(parent.heads(), vec![p1]);
        assert_eq!(parent.tails(), vec![stitched.tail]);
    }

    #[test]
    fn test_combine_rejects_ambiguous_child_head() {
        let mut parent = JobGraph::new("d1");
        parent.add_task(empty_task());

        let mut child = JobGraph::new("d1");
        child.add_task(empty_task());
        child.add_task(empty_task());

        assert!(parent.combine(child).is_err());
    }

    #[test]
    fn test_every_node_reachable_from_head_and_reaches_tail() {
        // 菱形：1 -> {2,3} -> 4
        let mut graph = JobGraph::new("d1");
        let a = graph.add_task(empty_task());
        let b = graph.add_task(empty_task());
        let c = graph.add_task(empty_task());
        let d = graph.add_task(empty_task());
        graph.add_task_relationship(a, b).unwrap();
        graph.add_task_relationship(a, c).unwrap();
        graph.add_task_relationship(b, d).unwrap();
        graph.add_task_relationship(c, d).unwrap();
        graph.validate().unwrap();

        assert_eq!(graph.heads(), vec![a]);
        assert_eq!(graph.tails(), vec![d]);
        let order = graph.topological_order().unwrap();
        assert_eq!(order.first(), Some(&a));
        assert_eq!(order.last(), Some(&d));
    }

    #[test]
    fn test_runnable_respects_predecessor_success() {
        let mut graph = JobGraph::new("d1");
        let a = graph.add_task(empty_task());
        let b = graph.add_task(empty_task());
        graph.add_task_relationship(a, b).unwrap();

        assert_eq!(graph.runnable_tasks(), vec![a]);

        graph.task_mut(a).unwrap().mark(TaskState::Success);
        assert_eq!(graph.runnable_tasks(), vec![b]);
    }

    #[test]
    fn test_rollback_order_is_reverse_topological() {
        let mut graph = JobGraph::new("d1");
        let a = graph.add_task(empty_task());
        let b = graph.add_task(empty_task());
        let c = graph.add_task(empty_task());
        graph.add_task_relationship(a, b).unwrap();
        graph.add_task_relationship(b, c).unwrap();

        graph.task_mut(a).unwrap().mark(TaskState::Success);
        graph.task_mut(b).unwrap().mark(TaskState::Success);
        graph.task_mut(c).unwrap().mark(TaskState::Failed);

        assert_eq!(graph.rollback_order().unwrap(), vec![b, a]);
    }
}
