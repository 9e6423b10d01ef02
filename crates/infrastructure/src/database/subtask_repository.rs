use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use orchestrator_core::models::{SubTask, SubTaskCounts};
use orchestrator_core::traits::SubTaskRepository;
use orchestrator_core::{OrchestratorError, OrchestratorResult};

pub struct SqliteSubTaskRepository {
    pool: SqlitePool,
}

impl SqliteSubTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_subtask(row: &sqlx::sqlite::SqliteRow) -> OrchestratorResult<SubTask> {
        let config_json: String = row.try_get("config")?;
        let config = serde_json::from_str(&config_json)
            .map_err(|e| OrchestratorError::Serialization(format!("解析子任务配置失败: {e}")))?;
        Ok(SubTask {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            source_kind: row.try_get("source_kind")?,
            source_url: row.try_get("source_url")?,
            model_code: row.try_get("model_code")?,
            config,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            priority: row.try_get("priority")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

const SUBTASK_COLUMNS: &str = "id, task_id, source_kind, source_url, model_code, config, node_id, \
     status, retry_count, next_retry_at, priority, error_message, created_at, started_at, \
     completed_at";

#[async_trait]
impl SubTaskRepository for SqliteSubTaskRepository {
    async fn create(&self, subtask: &SubTask) -> OrchestratorResult<SubTask> {
        let config_json = serde_json::to_string(&subtask.config)
            .map_err(|e| OrchestratorError::Serialization(format!("序列化子任务配置失败: {e}")))?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subtasks (task_id, source_kind, source_url, model_code, config, node_id,
                status, retry_count, next_retry_at, priority, error_message, created_at,
                started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {SUBTASK_COLUMNS}
            "#
        ))
        .bind(subtask.task_id)
        .bind(subtask.source_kind)
        .bind(&subtask.source_url)
        .bind(&subtask.model_code)
        .bind(config_json)
        .bind(&subtask.node_id)
        .bind(subtask.status)
        .bind(subtask.retry_count)
        .bind(subtask.next_retry_at)
        .bind(subtask.priority)
        .bind(&subtask.error_message)
        .bind(subtask.created_at)
        .bind(subtask.started_at)
        .bind(subtask.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Self::row_to_subtask(&row)
    }

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<SubTask>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        row.map(|r| Self::row_to_subtask(&r)).transpose()
    }

    async fn get_by_task_id(&self, task_id: i64) -> OrchestratorResult<Vec<SubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_subtask).collect()
    }

    async fn get_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<SubTask>> {
        // 优先级只是排序提示；同优先级下按创建时间FIFO
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SUBTASK_COLUMNS} FROM subtasks
            WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_subtask).collect()
    }

    async fn get_running_by_node(&self, node_id: &str) -> OrchestratorResult<Vec<SubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE node_id = $1 AND status = 'running' \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_subtask).collect()
    }

    async fn get_all_running(&self) -> OrchestratorResult<Vec<SubTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE status = 'running' \
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_subtask).collect()
    }

    async fn mark_running(&self, id: i64, node_id: &str) -> OrchestratorResult<bool> {
        // 状态前提写进WHERE：已被停止或已在途的子任务不会被二次分发
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'running', node_id = $2, started_at = $3, \
             next_retry_at = NULL, error_message = NULL WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: i64) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'completed', completed_at = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            debug!("子任务 {} 不在运行态，完成事件按no-op处理", id);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed_requeue(
        &self,
        id: i64,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'pending', retry_count = retry_count + 1, \
             node_id = NULL, started_at = NULL, next_retry_at = $2, error_message = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed_terminal(&self, id: i64, reason: &str) -> OrchestratorResult<bool> {
        // 来自运行态的终态失败消耗一次重试计数；PENDING直接失败
        // （重试预算耗尽后的"无可用节点"）不再递增
        let result = sqlx::query(
            "UPDATE subtasks SET retry_count = retry_count + \
                 (CASE WHEN status = 'running' THEN 1 ELSE 0 END), \
             status = 'failed', node_id = NULL, next_retry_at = NULL, \
             completed_at = $2, error_message = $3 \
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_stopped(&self, id: i64) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'stopped', node_id = NULL, next_retry_at = NULL, \
             completed_at = $2 WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_to_pending(&self, id: i64, reason: &str) -> OrchestratorResult<bool> {
        // 恢复路径不触碰retry_count：节点失联不算子任务的失败
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'pending', node_id = NULL, started_at = NULL, \
             next_retry_at = NULL, error_message = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_error_message(&self, id: i64, reason: &str) -> OrchestratorResult<()> {
        sqlx::query("UPDATE subtasks SET error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn revive_stopped(&self, task_id: i64) -> OrchestratorResult<u64> {
        let result = sqlx::query(
            "UPDATE subtasks SET status = 'pending', node_id = NULL, started_at = NULL, \
             completed_at = NULL, retry_count = 0, next_retry_at = NULL, error_message = NULL \
             WHERE task_id = $1 AND status = 'stopped'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, task_id: i64) -> OrchestratorResult<SubTaskCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END) AS running,
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'stopped' THEN 1 ELSE 0 END) AS stopped,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
            FROM subtasks WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        Ok(SubTaskCounts {
            pending: row.try_get::<Option<i32>, _>("pending")?.unwrap_or(0),
            running: row.try_get::<Option<i32>, _>("running")?.unwrap_or(0),
            completed: row.try_get::<Option<i32>, _>("completed")?.unwrap_or(0),
            stopped: row.try_get::<Option<i32>, _>("stopped")?.unwrap_or(0),
            failed: row.try_get::<Option<i32>, _>("failed")?.unwrap_or(0),
        })
    }
}
