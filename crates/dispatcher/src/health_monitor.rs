use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use orchestrator_core::models::{NodeHeartbeat, NodeRegistration, NodeStatus, SubTaskStatus};
use orchestrator_core::traits::{SubTaskRepository, TaskRepository};
use orchestrator_core::OrchestratorResult;

use crate::registry::NodeRegistry;

/// 单节点健康状态机
///
/// UNKNOWN → ONLINE → SUSPECT → OFFLINE，由心跳/生命周期事件
/// 驱动前进，由定时扫描驱动降级。显式离线事件与心跳超时走同一条
/// OFFLINE转移路径。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Online,
    Suspect,
    Offline,
}

/// 健康监控配置
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// 心跳静默进入SUSPECT的阈值（秒）
    pub suspect_threshold_seconds: i64,
    /// 心跳静默判定离线的阈值（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 扫描间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 是否自动清理长期离线节点
    pub auto_cleanup_offline_nodes: bool,
    /// 离线清理阈值（秒）
    pub offline_cleanup_threshold_seconds: i64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            suspect_threshold_seconds: 60,
            heartbeat_timeout_seconds: 120,
            sweep_interval_seconds: 30,
            auto_cleanup_offline_nodes: true,
            offline_cleanup_threshold_seconds: 300,
        }
    }
}

/// 节点健康监控
///
/// 消费节点生命周期/心跳事件更新注册表；节点判定离线时回收其上
/// 全部RUNNING子任务（复位为PENDING，不消耗重试预算），下个调度
/// 周期重新准入。所有离线处理幂等。
pub struct NodeHealthMonitor {
    registry: Arc<NodeRegistry>,
    subtask_repo: Arc<dyn SubTaskRepository>,
    task_repo: Arc<dyn TaskRepository>,
    config: HealthMonitorConfig,
    states: RwLock<HashMap<String, HealthState>>,
}

impl NodeHealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        subtask_repo: Arc<dyn SubTaskRepository>,
        task_repo: Arc<dyn TaskRepository>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            subtask_repo,
            task_repo,
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn health_state(&self, node_id: &str) -> HealthState {
        self.states
            .read()
            .await
            .get(node_id)
            .copied()
            .unwrap_or(HealthState::Unknown)
    }

    /// 节点上线通告
    pub async fn handle_node_online(
        &self,
        registration: NodeRegistration,
    ) -> OrchestratorResult<()> {
        let node_id = registration.node_id.clone();
        self.registry.register(registration).await?;
        self.states
            .write()
            .await
            .insert(node_id, HealthState::Online);
        Ok(())
    }

    /// 心跳：回到ONLINE状态
    pub async fn handle_heartbeat(&self, heartbeat: &NodeHeartbeat) -> OrchestratorResult<()> {
        self.registry.handle_heartbeat(heartbeat).await?;
        let mut states = self.states.write().await;
        let state = states
            .entry(heartbeat.node_id.clone())
            .or_insert(HealthState::Unknown);
        if *state == HealthState::Suspect {
            info!("节点 {} 心跳恢复，解除SUSPECT", heartbeat.node_id);
        }
        *state = HealthState::Online;
        Ok(())
    }

    /// 节点离线：显式离线事件与心跳超时共用此路径，幂等
    pub async fn handle_node_offline(
        &self,
        node_id: &str,
        reason: &str,
    ) -> OrchestratorResult<Vec<i64>> {
        self.registry.mark_offline(node_id).await?;
        self.states
            .write()
            .await
            .insert(node_id.to_string(), HealthState::Offline);

        // 回收该节点上全部运行中的子任务
        let orphaned = self.subtask_repo.get_running_by_node(node_id).await?;
        if orphaned.is_empty() {
            debug!("节点 {} 离线，无需要回收的子任务", node_id);
            return Ok(Vec::new());
        }

        info!(
            "节点 {} 离线（{}），回收 {} 个运行中子任务",
            node_id,
            reason,
            orphaned.len()
        );

        let mut reset_ids = Vec::new();
        let mut task_ids = BTreeSet::new();
        for subtask in orphaned {
            let message = format!("节点 {node_id} 失联: {reason}");
            if self.subtask_repo.reset_to_pending(subtask.id, &message).await? {
                self.registry.release(node_id, subtask.source_kind).await?;
                reset_ids.push(subtask.id);
                task_ids.insert(subtask.task_id);
            }
        }
        for task_id in task_ids {
            self.task_repo.refresh_status(task_id).await?;
        }

        Ok(reset_ids)
    }

    /// 定向回收：节点通过失败应答放弃了单个子任务
    pub async fn reset_subtask(&self, subtask_id: i64, reason: &str) -> OrchestratorResult<bool> {
        let subtask = match self.subtask_repo.get_by_id(subtask_id).await? {
            Some(subtask) => subtask,
            None => {
                warn!("定向回收时子任务 {} 不存在", subtask_id);
                return Ok(false);
            }
        };
        if subtask.status != SubTaskStatus::Running {
            debug!("子任务 {} 不在运行态，定向回收no-op", subtask_id);
            return Ok(false);
        }

        let message = format!("节点放弃子任务: {reason}");
        if !self.subtask_repo.reset_to_pending(subtask_id, &message).await? {
            return Ok(false);
        }
        if let Some(node_id) = &subtask.node_id {
            self.registry.release(node_id, subtask.source_kind).await?;
        }
        self.task_repo.refresh_status(subtask.task_id).await?;
        info!("子任务 {} 已定向回收等待重排: {}", subtask_id, reason);
        Ok(true)
    }

    /// 一轮健康扫描：降级静默节点，清理长期离线节点
    pub async fn sweep(&self, now: DateTime<Utc>) -> OrchestratorResult<()> {
        let nodes = self.registry.list_nodes().await?;
        for node in nodes {
            match node.status {
                NodeStatus::Online => {
                    if node.is_heartbeat_expired(self.config.heartbeat_timeout_seconds, now) {
                        warn!(
                            "节点 {} 心跳静默超过 {} 秒，判定离线",
                            node.id, self.config.heartbeat_timeout_seconds
                        );
                        self.handle_node_offline(&node.id, "心跳超时").await?;
                    } else if node
                        .is_heartbeat_expired(self.config.suspect_threshold_seconds, now)
                    {
                        let mut states = self.states.write().await;
                        let state = states
                            .entry(node.id.clone())
                            .or_insert(HealthState::Unknown);
                        if *state != HealthState::Suspect {
                            warn!(
                                "节点 {} 心跳静默超过 {} 秒，进入SUSPECT",
                                node.id, self.config.suspect_threshold_seconds
                            );
                            *state = HealthState::Suspect;
                        }
                    }
                }
                NodeStatus::Offline => {
                    if self.config.auto_cleanup_offline_nodes
                        && node.is_heartbeat_expired(
                            self.config.offline_cleanup_threshold_seconds,
                            now,
                        )
                    {
                        info!(
                            "清理离线节点 {} (离线超过 {} 秒)",
                            node.id, self.config.offline_cleanup_threshold_seconds
                        );
                        self.registry.deregister(&node.id).await?;
                        self.states.write().await.remove(&node.id);
                    }
                }
            }
        }
        Ok(())
    }

    /// 扫描循环，收到关闭信号后退出
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "节点健康监控已启动，扫描间隔: {}秒",
            self.config.sweep_interval_seconds
        );
        let interval = Duration::from_secs(self.config.sweep_interval_seconds);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("健康监控收到关闭信号，退出扫描循环");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                error!("健康扫描出错: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::WeightedCapacityStrategy;
    use crate::test_utils::{test_node, MemoryLedger};
    use orchestrator_core::models::{SourceKind, SubTask, Task, TransportKind};
    use orchestrator_core::traits::NodeRepository as _;

    async fn setup() -> (Arc<MemoryLedger>, NodeHealthMonitor, i64) {
        let ledger = MemoryLedger::new();
        let registry = Arc::new(NodeRegistry::new(
            ledger.node_repo(),
            Arc::new(WeightedCapacityStrategy::new()),
        ));
        let task = ledger
            .task_repo()
            .create(&Task::new("监控测试".to_string()))
            .await
            .unwrap();
        let monitor = NodeHealthMonitor::new(
            registry,
            ledger.subtask_repo(),
            ledger.task_repo(),
            HealthMonitorConfig::default(),
        );
        (ledger, monitor, task.id)
    }

    async fn running_on(ledger: &Arc<MemoryLedger>, task_id: i64, node_id: &str) -> SubTask {
        let repo = ledger.subtask_repo();
        let st = repo
            .create(&SubTask::new(
                task_id,
                SourceKind::Stream,
                "rtsp://cam".to_string(),
                "m1".to_string(),
            ))
            .await
            .unwrap();
        ledger
            .node_repo()
            .try_reserve_slot(node_id, SourceKind::Stream)
            .await
            .unwrap();
        repo.mark_running(st.id, node_id).await.unwrap();
        repo.get_by_id(st.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_offline_reclaims_running_subtasks() {
        // Scenario C: RUNNING子任务所在节点离线 → 复位PENDING、清节点、
        // 父任务活跃计数减一、下个tick可重排
        let (ledger, monitor, task_id) = setup().await;
        ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();
        let st = running_on(&ledger, task_id, "n1").await;
        ledger.task_repo().refresh_status(task_id).await.unwrap();
        assert_eq!(
            ledger.task_repo().get_by_id(task_id).await.unwrap().unwrap().active_subtasks,
            1
        );

        let reset = monitor.handle_node_offline("n1", "节点主动离线").await.unwrap();
        assert_eq!(reset, vec![st.id]);

        let stored = ledger.subtask_repo().get_by_id(st.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubTaskStatus::Pending);
        assert!(stored.node_id.is_none());
        assert!(stored.started_at.is_none());
        assert_eq!(stored.retry_count, 0, "节点失联不消耗重试预算");
        assert!(stored.is_due(Utc::now()), "回收后立即可重排");

        let task = ledger.task_repo().get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.active_subtasks, 0);

        let node = ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(node.current_task_count, 0);
    }

    #[tokio::test]
    async fn test_offline_event_is_idempotent() {
        let (ledger, monitor, task_id) = setup().await;
        ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();
        running_on(&ledger, task_id, "n1").await;

        let first = monitor.handle_node_offline("n1", "心跳超时").await.unwrap();
        assert_eq!(first.len(), 1);

        // 同一离线事件重复投递：终态与一次投递完全一致
        let second = monitor.handle_node_offline("n1", "心跳超时").await.unwrap();
        assert!(second.is_empty());

        let node = ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(node.current_task_count, 0);
        assert_eq!(monitor.health_state("n1").await, HealthState::Offline);
    }

    #[tokio::test]
    async fn test_sweep_degrades_silent_nodes() {
        let (ledger, monitor, _task_id) = setup().await;
        let mut node = test_node("n1", TransportKind::Mqtt, 5, 4);
        node.last_heartbeat = Utc::now();
        ledger.node_repo().register(&node).await.unwrap();
        monitor
            .handle_heartbeat(&NodeHeartbeat {
                node_id: "n1".to_string(),
                current_task_count: 0,
                cpu_usage: None,
                memory_usage: None,
                gpu_usage: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(monitor.health_state("n1").await, HealthState::Online);

        // 静默90秒：SUSPECT（超过60秒阈值但未到120秒离线阈值）
        let now = Utc::now() + chrono::Duration::seconds(90);
        monitor.sweep(now).await.unwrap();
        assert_eq!(monitor.health_state("n1").await, HealthState::Suspect);
        let stored = ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Online, "SUSPECT不影响调度资格判定前的状态");

        // 静默150秒：OFFLINE，与显式离线事件同路径
        let now = Utc::now() + chrono::Duration::seconds(150);
        monitor.sweep(now).await.unwrap();
        assert_eq!(monitor.health_state("n1").await, HealthState::Offline);
        let stored = ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_suspect_node() {
        let (ledger, monitor, _task_id) = setup().await;
        ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(90);
        monitor.sweep(now).await.unwrap();
        assert_eq!(monitor.health_state("n1").await, HealthState::Suspect);

        monitor
            .handle_heartbeat(&NodeHeartbeat {
                node_id: "n1".to_string(),
                current_task_count: 0,
                cpu_usage: Some(20.0),
                memory_usage: None,
                gpu_usage: None,
                timestamp: Utc::now() + chrono::Duration::seconds(91),
            })
            .await
            .unwrap();
        assert_eq!(monitor.health_state("n1").await, HealthState::Online);
    }

    #[tokio::test]
    async fn test_sweep_cleans_up_long_offline_nodes() {
        let (ledger, monitor, _task_id) = setup().await;
        ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();
        monitor.handle_node_offline("n1", "节点主动离线").await.unwrap();

        // 未到清理阈值：保留
        monitor.sweep(Utc::now() + chrono::Duration::seconds(100)).await.unwrap();
        assert!(ledger.node_repo().get_by_id("n1").await.unwrap().is_some());

        // 超过300秒：删除
        monitor.sweep(Utc::now() + chrono::Duration::seconds(400)).await.unwrap();
        assert!(ledger.node_repo().get_by_id("n1").await.unwrap().is_none());
        assert_eq!(monitor.health_state("n1").await, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_scoped_reset_single_subtask() {
        let (ledger, monitor, task_id) = setup().await;
        ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();
        let a = running_on(&ledger, task_id, "n1").await;
        let b = running_on(&ledger, task_id, "n1").await;

        assert!(monitor.reset_subtask(a.id, "GPU显存不足").await.unwrap());

        let a_stored = ledger.subtask_repo().get_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(a_stored.status, SubTaskStatus::Pending);
        // 只回收被点名的子任务
        let b_stored = ledger.subtask_repo().get_by_id(b.id).await.unwrap().unwrap();
        assert_eq!(b_stored.status, SubTaskStatus::Running);

        let node = ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(node.current_task_count, 1);

        // 重复定向回收no-op
        assert!(!monitor.reset_subtask(a.id, "again").await.unwrap());
    }
}
