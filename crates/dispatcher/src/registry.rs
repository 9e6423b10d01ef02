use std::sync::Arc;

use tracing::{debug, info, warn};

use orchestrator_core::models::{Node, NodeHeartbeat, NodeRegistration, NodeStatus, SourceKind};
use orchestrator_core::traits::NodeRepository;
use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::strategies::NodeSelectionStrategy;

/// 节点注册表：注册/心跳/选择/容量预留的统一入口
///
/// 负载计数的预留与释放都落到仓储的单语句条件更新上，
/// 并发分发之间不存在读-改-写窗口。
pub struct NodeRegistry {
    node_repo: Arc<dyn NodeRepository>,
    strategy: Arc<dyn NodeSelectionStrategy>,
}

impl NodeRegistry {
    pub fn new(
        node_repo: Arc<dyn NodeRepository>,
        strategy: Arc<dyn NodeSelectionStrategy>,
    ) -> Self {
        Self {
            node_repo,
            strategy,
        }
    }

    /// 节点注册：幂等upsert
    pub async fn register(&self, registration: NodeRegistration) -> OrchestratorResult<Node> {
        let node = Node::new(registration);
        self.node_repo.register(&node).await?;
        info!(
            "节点 {} 已注册 ({}, 容量: {})",
            node.id,
            node.hostname,
            node.max_concurrent_tasks
        );
        Ok(node)
    }

    /// 显式注销
    pub async fn deregister(&self, node_id: &str) -> OrchestratorResult<()> {
        self.node_repo.unregister(node_id).await?;
        info!("节点 {} 已注销", node_id);
        Ok(())
    }

    /// 心跳：刷新在线状态与资源指标
    pub async fn handle_heartbeat(&self, heartbeat: &NodeHeartbeat) -> OrchestratorResult<()> {
        match self.node_repo.update_heartbeat(heartbeat).await {
            Ok(()) => Ok(()),
            Err(OrchestratorError::NodeNotFound { id }) => {
                // 先于注册到达的心跳：记录并忽略，等节点补发上线通告
                warn!("收到未注册节点 {} 的心跳，忽略", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 标记节点离线。幂等：重复调用无额外副作用
    pub async fn mark_offline(&self, node_id: &str) -> OrchestratorResult<()> {
        match self.node_repo.update_status(node_id, NodeStatus::Offline).await {
            Ok(()) => {
                debug!("节点 {} 已标记离线", node_id);
                Ok(())
            }
            Err(OrchestratorError::NodeNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 为指定类型的子任务选择节点。None表示背压，调用方稍后重试
    pub async fn select_node(&self, kind: SourceKind) -> OrchestratorResult<Option<Node>> {
        let candidates = self.node_repo.get_online_nodes().await?;
        self.strategy.select(kind, &candidates).await
    }

    /// 乐观预留容量，失败说明容量在选择与预留之间被抢占
    pub async fn try_reserve(&self, node_id: &str, kind: SourceKind) -> OrchestratorResult<bool> {
        self.node_repo.try_reserve_slot(node_id, kind).await
    }

    /// 释放预留容量（分发失败或子任务结束）
    pub async fn release(&self, node_id: &str, kind: SourceKind) -> OrchestratorResult<()> {
        self.node_repo.release_slot(node_id, kind).await
    }

    pub async fn get_node(&self, node_id: &str) -> OrchestratorResult<Option<Node>> {
        self.node_repo.get_by_id(node_id).await
    }

    pub async fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        self.node_repo.list().await
    }
}
