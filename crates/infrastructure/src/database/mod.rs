pub mod node_repository;
pub mod subtask_repository;
pub mod task_repository;

pub use node_repository::SqliteNodeRepository;
pub use subtask_repository::SqliteSubTaskRepository;
pub use task_repository::SqliteTaskRepository;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

/// 建立SQLite连接池
pub async fn connect(url: &str, max_connections: u32) -> OrchestratorResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(OrchestratorError::Database)?;

    info!("数据库连接成功: {}", url);
    Ok(pool)
}

/// 启动期创建表结构（幂等）
pub async fn initialize_schema(pool: &SqlitePool) -> OrchestratorResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL DEFAULT '',
            ip_address TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL DEFAULT 0,
            transport TEXT NOT NULL,
            status TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 5,
            max_concurrent_tasks INTEGER NOT NULL DEFAULT 4,
            current_task_count INTEGER NOT NULL DEFAULT 0,
            image_task_count INTEGER NOT NULL DEFAULT 0,
            video_task_count INTEGER NOT NULL DEFAULT 0,
            stream_task_count INTEGER NOT NULL DEFAULT 0,
            cpu_usage REAL,
            memory_usage REAL,
            gpu_usage REAL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_heartbeat TEXT NOT NULL,
            registered_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(OrchestratorError::Database)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            active_subtasks INTEGER NOT NULL DEFAULT 0,
            total_subtasks INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            stopped_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(OrchestratorError::Database)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subtasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            source_kind TEXT NOT NULL,
            source_url TEXT NOT NULL,
            model_code TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            node_id TEXT,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(OrchestratorError::Database)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_subtasks_status ON subtasks(status, next_retry_at, priority, created_at)",
    )
    .execute(pool)
    .await
    .map_err(OrchestratorError::Database)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subtasks_node ON subtasks(node_id, status)")
        .execute(pool)
        .await
        .map_err(OrchestratorError::Database)?;

    info!("数据库表结构初始化完成");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // 内存库必须限制为单连接，否则每个连接各自一份数据
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("创建内存数据库失败");
    initialize_schema(&pool).await.expect("初始化表结构失败");
    pool
}
