//! 进程内作业仓储实现
//!
//! 用于嵌入式部署和测试。所有状态保存在内存中，接口语义与
//! SQLite实现保持一致。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{DdlTask, JobGraph, JobRepository, JobState, OperatorAction, OperatorCommand};

#[derive(Debug)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<i64, JobGraph>>,
    commands: Mutex<HashMap<i64, Vec<OperatorCommand>>>,
    next_job_id: AtomicI64,
    next_command_id: AtomicI64,
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
            next_job_id: AtomicI64::new(1),
            next_command_id: AtomicI64::new(1),
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create_job(&self, graph: &mut JobGraph) -> DdlResult<i64> {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        graph.job_id = job_id;
        for task in graph.tasks.values_mut() {
            task.job_id = job_id;
        }
        self.jobs.lock().unwrap().insert(job_id, graph.clone());

        debug!("持久化新作业: {}", graph.entity_description());
        Ok(job_id)
    }

    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(DdlEngineError::JobNotFound { job_id })?;
        job.state = state;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task(&self, task: &DdlTask) -> DdlResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&task.job_id)
            .ok_or(DdlEngineError::JobNotFound {
                job_id: task.job_id,
            })?;
        let stored = job
            .tasks
            .get_mut(&task.id)
            .ok_or(DdlEngineError::TaskNotFound {
                job_id: task.job_id,
                task_id: task.id,
            })?;
        *stored = task.clone();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> DdlResult<Option<JobGraph>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn load_active_jobs(&self) -> DdlResult<Vec<JobGraph>> {
        let jobs = self.jobs.lock().unwrap();
        let mut active: Vec<JobGraph> = jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|j| j.job_id);
        Ok(active)
    }

    async fn append_command(
        &self,
        job_id: i64,
        action: OperatorAction,
        requester: &str,
    ) -> DdlResult<i64> {
        if !self.jobs.lock().unwrap().contains_key(&job_id) {
            return Err(DdlEngineError::JobNotFound { job_id });
        }
        let mut command = OperatorCommand::new(job_id, action, requester);
        command.id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        let id = command.id;
        self.commands
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push(command);
        Ok(id)
    }

    async fn take_pending_commands(&self, job_id: i64) -> DdlResult<Vec<OperatorCommand>> {
        let mut commands = self.commands.lock().unwrap();
        let Some(queue) = commands.get_mut(&job_id) else {
            return Ok(Vec::new());
        };
        let mut taken = Vec::new();
        for command in queue.iter_mut() {
            if !command.consumed {
                command.consumed = true;
                taken.push(command.clone());
            }
        }
        Ok(taken)
    }
}
