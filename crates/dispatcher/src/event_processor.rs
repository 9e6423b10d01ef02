use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use orchestrator_core::models::{NodeEvent, ResultStatus, TaskResultEvent};
use orchestrator_core::traits::{SubTaskRepository, TaskRepository};
use orchestrator_core::OrchestratorResult;

use crate::health_monitor::NodeHealthMonitor;
use crate::registry::NodeRegistry;
use crate::retry_service::SubTaskRetryService;

/// 节点事件处理器
///
/// 消费传输层产出的统一事件流：生命周期与心跳交给健康监控，
/// 任务结果在此结算。不同子任务的结果事件各自独立结算，
/// 乱序到达不影响正确性；命中终态子任务的事件一律no-op。
pub struct NodeEventProcessor {
    registry: Arc<NodeRegistry>,
    health_monitor: Arc<NodeHealthMonitor>,
    subtask_repo: Arc<dyn SubTaskRepository>,
    task_repo: Arc<dyn TaskRepository>,
    retry_service: Arc<SubTaskRetryService>,
}

impl NodeEventProcessor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        health_monitor: Arc<NodeHealthMonitor>,
        subtask_repo: Arc<dyn SubTaskRepository>,
        task_repo: Arc<dyn TaskRepository>,
        retry_service: Arc<SubTaskRetryService>,
    ) -> Self {
        Self {
            registry,
            health_monitor,
            subtask_repo,
            task_repo,
            retry_service,
        }
    }

    /// 事件消费循环
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("节点事件处理器已启动");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("事件处理器收到关闭信号，退出");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                error!("处理节点事件出错: {}", e);
                            }
                        }
                        None => {
                            warn!("事件通道已关闭，事件处理器退出");
                            break;
                        }
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: NodeEvent) -> OrchestratorResult<()> {
        match event {
            NodeEvent::Connected(registration) => {
                self.health_monitor.handle_node_online(registration).await
            }
            NodeEvent::Disconnected { node_id } => {
                self.health_monitor
                    .handle_node_offline(&node_id, "节点主动离线")
                    .await
                    .map(|_| ())
            }
            NodeEvent::Heartbeat(heartbeat) => {
                self.health_monitor.handle_heartbeat(&heartbeat).await
            }
            NodeEvent::SubTaskFailureReply {
                subtask_id,
                message,
            } => self
                .health_monitor
                .reset_subtask(subtask_id, &message)
                .await
                .map(|_| ()),
            NodeEvent::TaskResult(result) => self.handle_task_result(result).await,
        }
    }

    /// 任务结果结算
    async fn handle_task_result(&self, result: TaskResultEvent) -> OrchestratorResult<()> {
        match result.status {
            ResultStatus::Running => {
                // 进度心跳，无状态变化
                debug!(
                    "子任务 {} 在节点侧运行中: {:?}",
                    result.subtask_id, result.message
                );
                Ok(())
            }
            ResultStatus::Completed => self.settle_completed(&result).await,
            ResultStatus::Failed => {
                let reason = result
                    .message
                    .unwrap_or_else(|| "节点上报执行失败".to_string());
                self.retry_service
                    .handle_failure(result.subtask_id, &reason)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn settle_completed(&self, result: &TaskResultEvent) -> OrchestratorResult<()> {
        let subtask = match self.subtask_repo.get_by_id(result.subtask_id).await? {
            Some(subtask) => subtask,
            None => {
                warn!("完成事件指向不存在的子任务 {}", result.subtask_id);
                return Ok(());
            }
        };

        // 迟到的完成事件（已超时失败/已停止）必须是no-op，绝不双重结算
        if !self.subtask_repo.mark_completed(result.subtask_id).await? {
            debug!(
                "子任务 {} 当前状态为 {}，完成事件按迟到no-op处理",
                result.subtask_id,
                subtask.status.as_str()
            );
            return Ok(());
        }

        if let Some(node_id) = &subtask.node_id {
            self.registry.release(node_id, subtask.source_kind).await?;
        }
        self.task_repo.refresh_status(subtask.task_id).await?;
        info!("子任务 {} 已完成", result.subtask_id);
        Ok(())
    }
}
