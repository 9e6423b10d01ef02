use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use orchestrator_core::models::{SubTaskCounts, Task, TaskStatus};
use orchestrator_core::traits::TaskRepository;
use orchestrator_core::{OrchestratorError, OrchestratorResult};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> OrchestratorResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            active_subtasks: row.try_get("active_subtasks")?,
            total_subtasks: row.try_get("total_subtasks")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            stopped_at: row.try_get("stopped_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const TASK_COLUMNS: &str = "id, name, status, error_message, active_subtasks, total_subtasks, \
     created_at, started_at, stopped_at, updated_at";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> OrchestratorResult<Task> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (name, status, error_message, active_subtasks, total_subtasks,
                created_at, started_at, stopped_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&task.name)
        .bind(task.status)
        .bind(&task.error_message)
        .bind(task.active_subtasks)
        .bind(task.total_subtasks)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.stopped_at)
        .bind(task.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        let created = Self::row_to_task(&row)?;
        debug!("任务创建成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        row.map(|r| Self::row_to_task(&r)).transpose()
    }

    async fn list(&self) -> OrchestratorResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn delete(&self, id: i64) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await.map_err(OrchestratorError::Database)?;

        sqlx::query("DELETE FROM subtasks WHERE task_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(OrchestratorError::Database)?;

        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotFound { id });
        }

        tx.commit().await.map_err(OrchestratorError::Database)?;
        debug!("任务删除成功: {}", id);
        Ok(())
    }

    async fn mark_started(&self, id: i64) -> OrchestratorResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET started_at = COALESCE(started_at, $2), error_message = NULL, \
             updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn mark_stopped(&self, id: i64, error_message: Option<&str>) -> OrchestratorResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET status = $2, error_message = $3, stopped_at = $4, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(TaskStatus::Stopped)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn refresh_status(&self, id: i64) -> OrchestratorResult<(TaskStatus, SubTaskCounts)> {
        // 聚合与回写在同一事务内完成，避免并发子任务结算互相覆盖
        let mut tx = self.pool.begin().await.map_err(OrchestratorError::Database)?;

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
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(OrchestratorError::Database)?;

        let counts = SubTaskCounts {
            pending: row.try_get::<Option<i32>, _>("pending")?.unwrap_or(0),
            running: row.try_get::<Option<i32>, _>("running")?.unwrap_or(0),
            completed: row.try_get::<Option<i32>, _>("completed")?.unwrap_or(0),
            stopped: row.try_get::<Option<i32>, _>("stopped")?.unwrap_or(0),
            failed: row.try_get::<Option<i32>, _>("failed")?.unwrap_or(0),
        };

        let (derived, message) = TaskStatus::derive(&counts);

        let result = sqlx::query(
            "UPDATE tasks SET status = $2, error_message = $3, active_subtasks = $4, \
             updated_at = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(derived)
        .bind(&message)
        .bind(counts.running)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::TaskNotFound { id });
        }

        tx.commit().await.map_err(OrchestratorError::Database)?;
        Ok((derived, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;
    use crate::database::SqliteSubTaskRepository;
    use orchestrator_core::models::{SourceKind, SubTask};
    use orchestrator_core::traits::SubTaskRepository;

    async fn create_task_with_subtasks(
        task_repo: &SqliteTaskRepository,
        subtask_repo: &SqliteSubTaskRepository,
        count: usize,
    ) -> (Task, Vec<SubTask>) {
        let task = task_repo.create(&Task::new("夜间巡检".to_string())).await.unwrap();
        let mut subtasks = Vec::new();
        for i in 0..count {
            let st = SubTask::new(
                task.id,
                SourceKind::Stream,
                format!("rtsp://camera-{i:02}/main"),
                "yolov8-person".to_string(),
            );
            subtasks.push(subtask_repo.create(&st).await.unwrap());
        }
        (task, subtasks)
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let pool = test_pool().await;
        let repo = SqliteTaskRepository::new(pool);
        let task = repo.create(&Task::new("t1".to_string())).await.unwrap();
        assert!(task.id > 0);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_refresh_status_derives_running() {
        let pool = test_pool().await;
        let task_repo = SqliteTaskRepository::new(pool.clone());
        let subtask_repo = SqliteSubTaskRepository::new(pool);
        let (task, subtasks) = create_task_with_subtasks(&task_repo, &subtask_repo, 3).await;

        assert!(subtask_repo.mark_running(subtasks[0].id, "n1").await.unwrap());
        let (status, counts) = task_repo.refresh_status(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::Running);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 2);

        let stored = task_repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.active_subtasks, 1);
    }

    #[tokio::test]
    async fn test_refresh_status_all_failed() {
        let pool = test_pool().await;
        let task_repo = SqliteTaskRepository::new(pool.clone());
        let subtask_repo = SqliteSubTaskRepository::new(pool);
        let (task, subtasks) = create_task_with_subtasks(&task_repo, &subtask_repo, 2).await;

        for st in &subtasks {
            subtask_repo.mark_failed_terminal(st.id, "no resource available").await.unwrap();
        }
        let (status, _) = task_repo.refresh_status(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let stored = task_repo.get_by_id(task.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("失败"));
    }

    #[tokio::test]
    async fn test_delete_cascades_subtasks() {
        let pool = test_pool().await;
        let task_repo = SqliteTaskRepository::new(pool.clone());
        let subtask_repo = SqliteSubTaskRepository::new(pool);
        let (task, _) = create_task_with_subtasks(&task_repo, &subtask_repo, 2).await;

        task_repo.delete(task.id).await.unwrap();
        assert!(task_repo.get_by_id(task.id).await.unwrap().is_none());
        assert!(subtask_repo.get_by_task_id(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_task() {
        let pool = test_pool().await;
        let repo = SqliteTaskRepository::new(pool);
        assert!(matches!(
            repo.delete(404).await.unwrap_err(),
            OrchestratorError::TaskNotFound { id: 404 }
        ));
    }
}
