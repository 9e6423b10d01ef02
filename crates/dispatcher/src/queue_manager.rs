use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use orchestrator_core::config::DispatcherConfig;
use orchestrator_core::models::{ResultConfig, SourceSpec, SubTask, TransportKind, WorkOrder};
use orchestrator_core::traits::{DispatchTransport, SubTaskRepository, TaskRepository};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::recovery::StartupRecoveryService;
use crate::registry::NodeRegistry;
use crate::retry_service::SubTaskRetryService;

/// 按节点接入方式路由到对应的传输通道
pub struct TransportSet {
    http: Arc<dyn DispatchTransport>,
    mqtt: Arc<dyn DispatchTransport>,
}

impl TransportSet {
    pub fn new(http: Arc<dyn DispatchTransport>, mqtt: Arc<dyn DispatchTransport>) -> Self {
        Self { http, mqtt }
    }

    pub fn for_kind(&self, kind: TransportKind) -> Arc<dyn DispatchTransport> {
        match kind {
            TransportKind::Http => self.http.clone(),
            TransportKind::Mqtt => self.mqtt.clone(),
        }
    }
}

/// 任务队列管理器
///
/// 有界并发的调度循环：每个tick拉取到期的PENDING子任务（同优先级
/// 按创建时间FIFO），为其选择节点、预留容量、标记运行，然后异步
/// 分发，循环本身从不等待分发完成。无可用节点是背压而不是错误。
/// 崩溃恢复在循环接受新准入之前完成。
pub struct TaskQueueManager {
    task_repo: Arc<dyn TaskRepository>,
    subtask_repo: Arc<dyn SubTaskRepository>,
    registry: Arc<NodeRegistry>,
    transports: Arc<TransportSet>,
    retry_service: Arc<SubTaskRetryService>,
    recovery: Arc<StartupRecoveryService>,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
}

impl TaskQueueManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        subtask_repo: Arc<dyn SubTaskRepository>,
        registry: Arc<NodeRegistry>,
        transports: Arc<TransportSet>,
        retry_service: Arc<SubTaskRetryService>,
        recovery: Arc<StartupRecoveryService>,
        config: DispatcherConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_dispatches));
        Self {
            task_repo,
            subtask_repo,
            registry,
            transports,
            retry_service,
            recovery,
            config,
            semaphore,
        }
    }

    /// 调度主循环。先跑崩溃恢复，再开始接受准入；
    /// 收到关闭信号后停止新准入（在途HTTP调用自然完成或超时，
    /// pub/sub等待由传输层在关机时统一取消）
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> OrchestratorResult<()> {
        let report = self.recovery.recover().await?;
        if !report.recovered_subtasks.is_empty() {
            info!(
                "调度循环启动前恢复了 {} 个子任务",
                report.recovered_subtasks.len()
            );
        }

        info!(
            "任务队列管理器已启动 (并发上限: {}, tick: {}ms)",
            self.config.max_concurrent_dispatches, self.config.tick_interval_ms
        );
        let tick = Duration::from_millis(self.config.tick_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("队列管理器收到关闭信号，停止新准入");
                    break;
                }
                _ = tokio::time::sleep(tick) => {}
            }
            if let Err(e) = self.schedule_once().await {
                error!("调度tick出错: {}", e);
            }
        }
        Ok(())
    }

    /// 单轮调度：在信号量余量内逐个准入到期子任务
    pub async fn schedule_once(&self) -> OrchestratorResult<usize> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let due = self
            .subtask_repo
            .get_due_pending(Utc::now(), available as i64)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut admitted = 0;
        for subtask in due {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let node = match self.registry.select_node(subtask.source_kind).await? {
                Some(node) => node,
                None => {
                    drop(permit);
                    self.handle_no_node(&subtask).await?;
                    continue;
                }
            };

            // 乐观预留容量；选择与预留之间被并发分发抢占时留在PENDING
            if !self.registry.try_reserve(&node.id, subtask.source_kind).await? {
                debug!(
                    "节点 {} 容量在预留前被抢占，子任务 {} 下个tick重试",
                    node.id, subtask.id
                );
                drop(permit);
                continue;
            }

            // 至多一次在途分发：抢不到PENDING说明已被停止或已被占用
            if !self.subtask_repo.mark_running(subtask.id, &node.id).await? {
                self.registry.release(&node.id, subtask.source_kind).await?;
                drop(permit);
                continue;
            }
            self.task_repo.refresh_status(subtask.task_id).await?;

            let order = self.build_work_order(&subtask).await?;
            let transport = self.transports.for_kind(node.transport);
            let retry_service = self.retry_service.clone();

            // 异步分发：调度循环不阻塞在分发完成上
            tokio::spawn(async move {
                let subtask_id = order.subtask_id;
                match transport.dispatch(&node, &order).await {
                    Ok(ack) => {
                        debug!(
                            "子任务 {} 已被节点 {} 受理 (节点任务: {:?})",
                            subtask_id, node.id, ack.node_task_id
                        );
                    }
                    Err(e) => {
                        let reason = format!("{}: {}", e.kind_label(), e);
                        warn!("子任务 {} 分发失败: {}", subtask_id, reason);
                        if let Err(err) = retry_service.handle_failure(subtask_id, &reason).await
                        {
                            error!("结算子任务 {} 失败时出错: {}", subtask_id, err);
                        }
                    }
                }
                drop(permit);
            });
            admitted += 1;
        }

        Ok(admitted)
    }

    /// 无可用节点：背压，不是错误。子任务留在PENDING等下个tick；
    /// 只有重试预算已被真实分发失败耗尽时才终态失败
    async fn handle_no_node(&self, subtask: &SubTask) -> OrchestratorResult<()> {
        let policy = self.retry_service.policy();
        if policy.is_exhausted(subtask.retry_count) {
            warn!(
                "子任务 {} 重试预算耗尽且无可用节点，终态失败",
                subtask.id
            );
            self.subtask_repo
                .mark_failed_terminal(subtask.id, "no resource available")
                .await?;
            self.task_repo.refresh_status(subtask.task_id).await?;
        } else {
            debug!("子任务 {} 暂无可用节点，保持PENDING", subtask.id);
            self.subtask_repo
                .set_error_message(subtask.id, "no resource available")
                .await?;
        }
        Ok(())
    }

    async fn build_work_order(&self, subtask: &SubTask) -> OrchestratorResult<WorkOrder> {
        let task = self
            .task_repo
            .get_by_id(subtask.task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound {
                id: subtask.task_id,
            })?;

        Ok(WorkOrder {
            task_id: subtask.task_id,
            subtask_id: subtask.id,
            task_name: task.name,
            source: SourceSpec {
                kind: subtask.source_kind,
                url: subtask.source_url.clone(),
            },
            model_code: subtask.model_code.clone(),
            config: subtask.config.clone(),
            result: ResultConfig::default(),
        })
    }

    /// 当前空闲的分发并发额度（测试与监控用）
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
