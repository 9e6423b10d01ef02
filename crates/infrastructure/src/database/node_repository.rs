use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use orchestrator_core::models::{Node, NodeHeartbeat, NodeStatus, SourceKind};
use orchestrator_core::traits::NodeRepository;
use orchestrator_core::{OrchestratorError, OrchestratorResult};

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> OrchestratorResult<Node> {
        Ok(Node {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            ip_address: row.try_get("ip_address")?,
            port: row.try_get("port")?,
            transport: row.try_get("transport")?,
            status: row.try_get("status")?,
            weight: row.try_get("weight")?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            current_task_count: row.try_get("current_task_count")?,
            image_task_count: row.try_get("image_task_count")?,
            video_task_count: row.try_get("video_task_count")?,
            stream_task_count: row.try_get("stream_task_count")?,
            cpu_usage: row.try_get("cpu_usage")?,
            memory_usage: row.try_get("memory_usage")?,
            gpu_usage: row.try_get("gpu_usage")?,
            is_active: row.try_get("is_active")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn kind_column(kind: SourceKind) -> &'static str {
        match kind {
            SourceKind::Image => "image_task_count",
            SourceKind::Video => "video_task_count",
            SourceKind::Stream => "stream_task_count",
        }
    }
}

const NODE_COLUMNS: &str = "id, hostname, ip_address, port, transport, status, weight, \
     max_concurrent_tasks, current_task_count, image_task_count, video_task_count, \
     stream_task_count, cpu_usage, memory_usage, gpu_usage, is_active, last_heartbeat, registered_at";

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn register(&self, node: &Node) -> OrchestratorResult<()> {
        // 幂等upsert：重复注册只刷新接入信息，不清零负载计数
        sqlx::query(
            r#"
            INSERT INTO nodes (id, hostname, ip_address, port, transport, status, weight,
                max_concurrent_tasks, current_task_count, image_task_count, video_task_count,
                stream_task_count, cpu_usage, memory_usage, gpu_usage, is_active,
                last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                ip_address = excluded.ip_address,
                port = excluded.port,
                transport = excluded.transport,
                status = excluded.status,
                weight = excluded.weight,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(&node.ip_address)
        .bind(node.port)
        .bind(node.transport)
        .bind(node.status)
        .bind(node.weight)
        .bind(node.max_concurrent_tasks)
        .bind(node.current_task_count)
        .bind(node.image_task_count)
        .bind(node.video_task_count)
        .bind(node.stream_task_count)
        .bind(node.cpu_usage)
        .bind(node.memory_usage)
        .bind(node.gpu_usage)
        .bind(node.is_active)
        .bind(node.last_heartbeat)
        .bind(node.registered_at)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        debug!("节点注册成功: {}", node.id);
        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> OrchestratorResult<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            });
        }

        debug!("节点注销成功: {}", node_id);
        Ok(())
    }

    async fn get_by_id(&self, node_id: &str) -> OrchestratorResult<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"))
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        row.map(|r| Self::row_to_node(&r)).transpose()
    }

    async fn list(&self) -> OrchestratorResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY registered_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn get_online_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE status = $1 AND is_active = 1 ORDER BY id ASC"
        ))
        .bind(NodeStatus::Online)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn update_status(&self, node_id: &str, status: NodeStatus) -> OrchestratorResult<()> {
        let result = sqlx::query("UPDATE nodes SET status = $2 WHERE id = $1")
            .bind(node_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_heartbeat(&self, heartbeat: &NodeHeartbeat) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET status = $2, last_heartbeat = $3, cpu_usage = $4,
                memory_usage = $5, gpu_usage = $6
            WHERE id = $1
            "#,
        )
        .bind(&heartbeat.node_id)
        .bind(NodeStatus::Online)
        .bind(heartbeat.timestamp)
        .bind(heartbeat.cpu_usage)
        .bind(heartbeat.memory_usage)
        .bind(heartbeat.gpu_usage)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NodeNotFound {
                id: heartbeat.node_id.clone(),
            });
        }
        Ok(())
    }

    async fn try_reserve_slot(
        &self,
        node_id: &str,
        kind: SourceKind,
    ) -> OrchestratorResult<bool> {
        // 单条条件UPDATE完成检查与预留，并发分发下不会超卖
        let sql = format!(
            "UPDATE nodes SET current_task_count = current_task_count + 1, {col} = {col} + 1 \
             WHERE id = $1 AND status = $2 AND is_active = 1 \
             AND current_task_count < max_concurrent_tasks",
            col = Self::kind_column(kind)
        );
        let result = sqlx::query(&sql)
            .bind(node_id)
            .bind(NodeStatus::Online)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot(&self, node_id: &str, kind: SourceKind) -> OrchestratorResult<()> {
        let sql = format!(
            "UPDATE nodes SET current_task_count = MAX(current_task_count - 1, 0), \
             {col} = MAX({col} - 1, 0) WHERE id = $1",
            col = Self::kind_column(kind)
        );
        sqlx::query(&sql)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    async fn set_active(&self, node_id: &str, active: bool) -> OrchestratorResult<()> {
        let result = sqlx::query("UPDATE nodes SET is_active = $2 WHERE id = $1")
            .bind(node_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            });
        }
        Ok(())
    }
}
