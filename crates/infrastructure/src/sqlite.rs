//! SQLite作业仓储实现
//!
//! 作业图拆成三张表持久化：作业行、任务行（载荷为带kind标签的JSON）、
//! 边行；操作员指令单独一张追加表。

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use ddl_core::{DdlEngineError, DdlResult};
use ddl_domain::{
    DdlTask, JobGraph, JobRepository, JobState, OperatorAction, OperatorCommand, TaskPayload,
    TaskState,
};

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 建立连接池并初始化表结构
    pub async fn connect(url: &str) -> DdlResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DdlEngineError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> DdlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ddl_jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_job_id INTEGER,
                schema_name TEXT NOT NULL,
                state TEXT NOT NULL,
                labeled_head INTEGER,
                labeled_tail INTEGER,
                excluded_resources TEXT NOT NULL,
                max_parallelism INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ddl_tasks (
                job_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                schema_name TEXT NOT NULL,
                state TEXT NOT NULL,
                payload TEXT NOT NULL,
                message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, task_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ddl_task_edges (
                job_id INTEGER NOT NULL,
                predecessor_id INTEGER NOT NULL,
                successor_id INTEGER NOT NULL,
                PRIMARY KEY (job_id, predecessor_id, successor_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ddl_operator_commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                requester TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> DdlResult<DdlTask> {
        let payload_json: String = row.try_get("payload")?;
        let payload: TaskPayload = serde_json::from_str(&payload_json)?;
        let state: TaskState = row.try_get("state")?;
        Ok(DdlTask {
            id: row.try_get("task_id")?,
            job_id: row.try_get("job_id")?,
            schema_name: row.try_get("schema_name")?,
            state,
            payload,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn load_graph(&self, row: &sqlx::sqlite::SqliteRow) -> DdlResult<JobGraph> {
        let job_id: i64 = row.try_get("job_id")?;

        let task_rows = sqlx::query(
            "SELECT job_id, task_id, schema_name, state, payload, message, created_at, updated_at
             FROM ddl_tasks WHERE job_id = $1 ORDER BY task_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = Vec::with_capacity(task_rows.len());
        for task_row in &task_rows {
            tasks.push(Self::row_to_task(task_row)?);
        }

        let edge_rows = sqlx::query(
            "SELECT predecessor_id, successor_id FROM ddl_task_edges WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        let mut edges = Vec::with_capacity(edge_rows.len());
        for edge_row in &edge_rows {
            edges.push((
                edge_row.try_get("predecessor_id")?,
                edge_row.try_get("successor_id")?,
            ));
        }

        let resources_json: String = row.try_get("excluded_resources")?;
        let excluded_resources: BTreeSet<String> = serde_json::from_str(&resources_json)?;
        let state: JobState = row.try_get("state")?;
        let max_parallelism: i64 = row.try_get("max_parallelism")?;

        Ok(JobGraph::restore(
            job_id,
            row.try_get("parent_job_id")?,
            row.try_get("schema_name")?,
            state,
            tasks,
            edges,
            row.try_get("labeled_head")?,
            row.try_get("labeled_tail")?,
            excluded_resources,
            max_parallelism as usize,
            row.try_get("error_message")?,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        ))
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_job(&self, graph: &mut JobGraph) -> DdlResult<i64> {
        let mut txn = self.pool.begin().await?;

        let resources_json = serde_json::to_string(&graph.excluded_resources)?;
        let row = sqlx::query(
            r#"
            INSERT INTO ddl_jobs (parent_job_id, schema_name, state, labeled_head, labeled_tail,
                                  excluded_resources, max_parallelism, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING job_id
            "#,
        )
        .bind(graph.parent_job_id)
        .bind(&graph.schema_name)
        .bind(graph.state)
        .bind(graph.labeled_head)
        .bind(graph.labeled_tail)
        .bind(&resources_json)
        .bind(graph.max_parallelism as i64)
        .bind(&graph.error_message)
        .bind(graph.created_at)
        .bind(graph.updated_at)
        .fetch_one(&mut *txn)
        .await?;
        let job_id: i64 = row.try_get("job_id")?;

        graph.job_id = job_id;
        for task in graph.tasks.values_mut() {
            task.job_id = job_id;
        }

        for task in graph.tasks.values() {
            let payload_json = serde_json::to_string(&task.payload)?;
            sqlx::query(
                r#"
                INSERT INTO ddl_tasks (job_id, task_id, schema_name, state, payload, message, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(job_id)
            .bind(task.id)
            .bind(&task.schema_name)
            .bind(task.state)
            .bind(&payload_json)
            .bind(&task.message)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut *txn)
            .await?;
        }

        for (predecessor, successor) in &graph.edges {
            sqlx::query(
                "INSERT INTO ddl_task_edges (job_id, predecessor_id, successor_id) VALUES ($1, $2, $3)",
            )
            .bind(job_id)
            .bind(predecessor)
            .bind(successor)
            .execute(&mut *txn)
            .await?;
        }

        txn.commit().await?;
        debug!("持久化新作业: {}", graph.entity_description());
        Ok(job_id)
    }

    async fn update_job_state(
        &self,
        job_id: i64,
        state: JobState,
        error_message: Option<&str>,
    ) -> DdlResult<()> {
        let now: DateTime<Utc> = Utc::now();
        let result = if let Some(message) = error_message {
            sqlx::query(
                "UPDATE ddl_jobs SET state = $2, error_message = $3, updated_at = $4 WHERE job_id = $1",
            )
            .bind(job_id)
            .bind(state)
            .bind(message)
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE ddl_jobs SET state = $2, updated_at = $3 WHERE job_id = $1")
                .bind(job_id)
                .bind(state)
                .bind(now)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(DdlEngineError::JobNotFound { job_id });
        }
        Ok(())
    }

    async fn update_task(&self, task: &DdlTask) -> DdlResult<()> {
        let payload_json = serde_json::to_string(&task.payload)?;
        let result = sqlx::query(
            r#"
            UPDATE ddl_tasks
            SET state = $3, payload = $4, message = $5, updated_at = $6
            WHERE job_id = $1 AND task_id = $2
            "#,
        )
        .bind(task.job_id)
        .bind(task.id)
        .bind(task.state)
        .bind(&payload_json)
        .bind(&task.message)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DdlEngineError::TaskNotFound {
                job_id: task.job_id,
                task_id: task.id,
            });
        }
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> DdlResult<Option<JobGraph>> {
        let row = sqlx::query("SELECT * FROM ddl_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load_graph(&row).await?)),
            None => Ok(None),
        }
    }

    async fn load_active_jobs(&self) -> DdlResult<Vec<JobGraph>> {
        let rows = sqlx::query(
            "SELECT * FROM ddl_jobs
             WHERE state NOT IN ('SUCCESS', 'ROLLED_BACK', 'ROLLBACK_FAILED')
             ORDER BY job_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(self.load_graph(row).await?);
        }
        Ok(jobs)
    }

    async fn append_command(
        &self,
        job_id: i64,
        action: OperatorAction,
        requester: &str,
    ) -> DdlResult<i64> {
        let exists = sqlx::query("SELECT job_id FROM ddl_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(DdlEngineError::JobNotFound { job_id });
        }

        let command = OperatorCommand::new(job_id, action, requester);
        let action_json = serde_json::to_string(&command.action)?;
        let row = sqlx::query(
            r#"
            INSERT INTO ddl_operator_commands (job_id, action, requester, trace_id, consumed, created_at)
            VALUES ($1, $2, $3, $4, 0, $5)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(&action_json)
        .bind(&command.requester)
        .bind(&command.trace_id)
        .bind(command.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn take_pending_commands(&self, job_id: i64) -> DdlResult<Vec<OperatorCommand>> {
        let rows = sqlx::query(
            r#"
            UPDATE ddl_operator_commands SET consumed = 1
            WHERE job_id = $1 AND consumed = 0
            RETURNING id, job_id, action, requester, trace_id, consumed, created_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in &rows {
            let action_json: String = row.try_get("action")?;
            commands.push(OperatorCommand {
                id: row.try_get("id")?,
                job_id: row.try_get("job_id")?,
                action: serde_json::from_str(&action_json)?,
                requester: row.try_get("requester")?,
                trace_id: row.try_get("trace_id")?,
                consumed: row.try_get("consumed")?,
                created_at: row.try_get("created_at")?,
            });
        }
        commands.sort_by_key(|c| c.id);
        Ok(commands)
    }
}
