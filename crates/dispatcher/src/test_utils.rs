//! 测试用内存实现：仓储与传输的mock

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use orchestrator_core::models::{
    Node, NodeHeartbeat, NodeStatus, RetryPolicy, SourceKind, SubTask, SubTaskCounts,
    SubTaskStatus, Task, TaskStatus, TransportKind, WorkOrder,
};
use orchestrator_core::traits::{
    DispatchAck, DispatchTransport, NodeRepository, SubTaskRepository, TaskRepository,
};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

/// 共享的内存台账，三个仓储视图指向同一份数据
pub struct MemoryLedger {
    inner: Arc<Mutex<LedgerInner>>,
    next_task_id: Arc<AtomicI64>,
    next_subtask_id: Arc<AtomicI64>,
}

#[derive(Default)]
struct LedgerInner {
    nodes: BTreeMap<String, Node>,
    tasks: BTreeMap<i64, Task>,
    subtasks: BTreeMap<i64, SubTask>,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(LedgerInner::default())),
            next_task_id: Arc::new(AtomicI64::new(1)),
            next_subtask_id: Arc::new(AtomicI64::new(1)),
        })
    }

    fn share(&self) -> MemoryLedger {
        MemoryLedger {
            inner: self.inner.clone(),
            next_task_id: self.next_task_id.clone(),
            next_subtask_id: self.next_subtask_id.clone(),
        }
    }

    pub fn node_repo(&self) -> Arc<MemoryNodeRepository> {
        Arc::new(MemoryNodeRepository {
            ledger: self.share(),
        })
    }

    pub fn task_repo(&self) -> Arc<MemoryTaskRepository> {
        Arc::new(MemoryTaskRepository {
            ledger: self.share(),
        })
    }

    pub fn subtask_repo(&self) -> Arc<MemorySubTaskRepository> {
        Arc::new(MemorySubTaskRepository {
            ledger: self.share(),
        })
    }
}

pub struct MemoryNodeRepository {
    ledger: MemoryLedger,
}

pub struct MemoryTaskRepository {
    ledger: MemoryLedger,
}

pub struct MemorySubTaskRepository {
    ledger: MemoryLedger,
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    async fn register(&self, node: &Node) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.nodes.get_mut(&node.id) {
            Some(existing) => {
                existing.hostname = node.hostname.clone();
                existing.ip_address = node.ip_address.clone();
                existing.port = node.port;
                existing.transport = node.transport;
                existing.status = node.status;
                existing.weight = node.weight;
                existing.max_concurrent_tasks = node.max_concurrent_tasks;
                existing.last_heartbeat = node.last_heartbeat;
            }
            None => {
                inner.nodes.insert(node.id.clone(), node.clone());
            }
        }
        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        inner
            .nodes
            .remove(node_id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            })
    }

    async fn get_by_id(&self, node_id: &str) -> OrchestratorResult<Option<Node>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner.nodes.get(node_id).cloned())
    }

    async fn list(&self) -> OrchestratorResult<Vec<Node>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner.nodes.values().cloned().collect())
    }

    async fn get_online_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online && n.is_active)
            .cloned()
            .collect())
    }

    async fn update_status(&self, node_id: &str, status: NodeStatus) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            })?;
        node.status = status;
        Ok(())
    }

    async fn update_heartbeat(&self, heartbeat: &NodeHeartbeat) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&heartbeat.node_id).ok_or_else(|| {
            OrchestratorError::NodeNotFound {
                id: heartbeat.node_id.clone(),
            }
        })?;
        node.status = NodeStatus::Online;
        node.last_heartbeat = heartbeat.timestamp;
        node.cpu_usage = heartbeat.cpu_usage;
        node.memory_usage = heartbeat.memory_usage;
        node.gpu_usage = heartbeat.gpu_usage;
        Ok(())
    }

    async fn try_reserve_slot(
        &self,
        node_id: &str,
        kind: SourceKind,
    ) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let node = match inner.nodes.get_mut(node_id) {
            Some(node) => node,
            None => return Ok(false),
        };
        if !node.has_capacity() {
            return Ok(false);
        }
        node.current_task_count += 1;
        match kind {
            SourceKind::Image => node.image_task_count += 1,
            SourceKind::Video => node.video_task_count += 1,
            SourceKind::Stream => node.stream_task_count += 1,
        }
        Ok(true)
    }

    async fn release_slot(&self, node_id: &str, kind: SourceKind) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.current_task_count = (node.current_task_count - 1).max(0);
            match kind {
                SourceKind::Image => node.image_task_count = (node.image_task_count - 1).max(0),
                SourceKind::Video => node.video_task_count = (node.video_task_count - 1).max(0),
                SourceKind::Stream => {
                    node.stream_task_count = (node.stream_task_count - 1).max(0)
                }
            }
        }
        Ok(())
    }

    async fn set_active(&self, node_id: &str, active: bool) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound {
                id: node_id.to_string(),
            })?;
        node.is_active = active;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &Task) -> OrchestratorResult<Task> {
        let mut created = task.clone();
        created.id = self.ledger.next_task_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.ledger.inner.lock().unwrap();
        inner.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<Task>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn list(&self) -> OrchestratorResult<Vec<Task>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner.tasks.values().cloned().collect())
    }

    async fn delete(&self, id: i64) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        if inner.tasks.remove(&id).is_none() {
            return Err(OrchestratorError::TaskNotFound { id });
        }
        inner.subtasks.retain(|_, st| st.task_id != id);
        Ok(())
    }

    async fn mark_started(&self, id: i64) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::TaskNotFound { id })?;
        task.started_at.get_or_insert_with(Utc::now);
        task.error_message = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_stopped(&self, id: i64, error_message: Option<&str>) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::TaskNotFound { id })?;
        task.status = TaskStatus::Stopped;
        task.error_message = error_message.map(|s| s.to_string());
        task.stopped_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn refresh_status(&self, id: i64) -> OrchestratorResult<(TaskStatus, SubTaskCounts)> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let mut counts = SubTaskCounts::default();
        for st in inner.subtasks.values().filter(|st| st.task_id == id) {
            match st.status {
                SubTaskStatus::Pending => counts.pending += 1,
                SubTaskStatus::Running => counts.running += 1,
                SubTaskStatus::Completed => counts.completed += 1,
                SubTaskStatus::Stopped => counts.stopped += 1,
                SubTaskStatus::Failed => counts.failed += 1,
            }
        }
        let (derived, message) = TaskStatus::derive(&counts);
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(OrchestratorError::TaskNotFound { id })?;
        task.status = derived;
        task.error_message = message;
        task.active_subtasks = counts.running;
        task.updated_at = Utc::now();
        Ok((derived, counts))
    }
}

#[async_trait]
impl SubTaskRepository for MemorySubTaskRepository {
    async fn create(&self, subtask: &SubTask) -> OrchestratorResult<SubTask> {
        let mut created = subtask.clone();
        created.id = self.ledger.next_subtask_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.ledger.inner.lock().unwrap();
        inner.subtasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<SubTask>> {
        let inner = self.ledger.inner.lock().unwrap();
        Ok(inner.subtasks.get(&id).cloned())
    }

    async fn get_by_task_id(&self, task_id: i64) -> OrchestratorResult<Vec<SubTask>> {
        let inner = self.ledger.inner.lock().unwrap();
        let mut result: Vec<SubTask> = inner
            .subtasks
            .values()
            .filter(|st| st.task_id == task_id)
            .cloned()
            .collect();
        result.sort_by_key(|st| (st.created_at, st.id));
        Ok(result)
    }

    async fn get_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<SubTask>> {
        let inner = self.ledger.inner.lock().unwrap();
        let mut due: Vec<SubTask> = inner
            .subtasks
            .values()
            .filter(|st| st.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn get_running_by_node(&self, node_id: &str) -> OrchestratorResult<Vec<SubTask>> {
        let inner = self.ledger.inner.lock().unwrap();
        let mut result: Vec<SubTask> = inner
            .subtasks
            .values()
            .filter(|st| {
                st.status == SubTaskStatus::Running && st.node_id.as_deref() == Some(node_id)
            })
            .cloned()
            .collect();
        result.sort_by_key(|st| (st.created_at, st.id));
        Ok(result)
    }

    async fn get_all_running(&self) -> OrchestratorResult<Vec<SubTask>> {
        let inner = self.ledger.inner.lock().unwrap();
        let mut result: Vec<SubTask> = inner
            .subtasks
            .values()
            .filter(|st| st.status == SubTaskStatus::Running)
            .cloned()
            .collect();
        result.sort_by_key(|st| (st.created_at, st.id));
        Ok(result)
    }

    async fn mark_running(&self, id: i64, node_id: &str) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st) if st.status == SubTaskStatus::Pending => {
                st.status = SubTaskStatus::Running;
                st.node_id = Some(node_id.to_string());
                st.started_at = Some(Utc::now());
                st.next_retry_at = None;
                st.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, id: i64) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st) if st.status == SubTaskStatus::Running => {
                st.status = SubTaskStatus::Completed;
                st.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed_requeue(
        &self,
        id: i64,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st) if st.status == SubTaskStatus::Running => {
                st.status = SubTaskStatus::Pending;
                st.retry_count += 1;
                st.node_id = None;
                st.started_at = None;
                st.next_retry_at = Some(next_retry_at);
                st.error_message = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed_terminal(&self, id: i64, reason: &str) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st)
                if st.status == SubTaskStatus::Pending || st.status == SubTaskStatus::Running =>
            {
                if st.status == SubTaskStatus::Running {
                    st.retry_count += 1;
                }
                st.status = SubTaskStatus::Failed;
                st.node_id = None;
                st.next_retry_at = None;
                st.completed_at = Some(Utc::now());
                st.error_message = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_stopped(&self, id: i64) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st)
                if st.status == SubTaskStatus::Pending || st.status == SubTaskStatus::Running =>
            {
                st.status = SubTaskStatus::Stopped;
                st.node_id = None;
                st.next_retry_at = None;
                st.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_to_pending(&self, id: i64, reason: &str) -> OrchestratorResult<bool> {
        let mut inner = self.ledger.inner.lock().unwrap();
        match inner.subtasks.get_mut(&id) {
            Some(st) if st.status == SubTaskStatus::Running => {
                st.status = SubTaskStatus::Pending;
                st.node_id = None;
                st.started_at = None;
                st.next_retry_at = None;
                st.error_message = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_error_message(&self, id: i64, reason: &str) -> OrchestratorResult<()> {
        let mut inner = self.ledger.inner.lock().unwrap();
        if let Some(st) = inner.subtasks.get_mut(&id) {
            st.error_message = Some(reason.to_string());
        }
        Ok(())
    }

    async fn revive_stopped(&self, task_id: i64) -> OrchestratorResult<u64> {
        let mut inner = self.ledger.inner.lock().unwrap();
        let mut revived = 0;
        for st in inner
            .subtasks
            .values_mut()
            .filter(|st| st.task_id == task_id && st.status == SubTaskStatus::Stopped)
        {
            st.status = SubTaskStatus::Pending;
            st.node_id = None;
            st.started_at = None;
            st.completed_at = None;
            st.retry_count = 0;
            st.next_retry_at = None;
            st.error_message = None;
            revived += 1;
        }
        Ok(revived)
    }

    async fn count_by_status(&self, task_id: i64) -> OrchestratorResult<SubTaskCounts> {
        let inner = self.ledger.inner.lock().unwrap();
        let mut counts = SubTaskCounts::default();
        for st in inner.subtasks.values().filter(|st| st.task_id == task_id) {
            match st.status {
                SubTaskStatus::Pending => counts.pending += 1,
                SubTaskStatus::Running => counts.running += 1,
                SubTaskStatus::Completed => counts.completed += 1,
                SubTaskStatus::Stopped => counts.stopped += 1,
                SubTaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

/// 脚本化的传输mock：按顺序弹出预设结果，默认成功
pub struct MockTransport {
    kind: TransportKind,
    outcomes: Mutex<VecDeque<OrchestratorResult<DispatchAck>>>,
    pub dispatched: Mutex<Vec<(String, i64)>>,
    pub stopped: Mutex<Vec<(String, i64)>>,
    dispatch_delay: Option<Duration>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            outcomes: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            dispatch_delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = Some(delay);
        self
    }

    /// 预设下一次dispatch的结果
    pub fn push_outcome(&self, outcome: OrchestratorResult<DispatchAck>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn dispatched_subtasks(&self) -> Vec<i64> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }
}

#[async_trait]
impl DispatchTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn dispatch(&self, node: &Node, order: &WorkOrder) -> OrchestratorResult<DispatchAck> {
        if let Some(delay) = self.dispatch_delay {
            tokio::time::sleep(delay).await;
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((node.id.clone(), order.subtask_id));
        let scripted = self.outcomes.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(DispatchAck {
                node_task_id: Some(format!("nt-{}", order.subtask_id)),
            }),
        }
    }

    async fn stop(&self, node: &Node, _task_id: i64, subtask_id: i64) -> OrchestratorResult<()> {
        self.stopped
            .lock()
            .unwrap()
            .push((node.id.clone(), subtask_id));
        Ok(())
    }
}

/// 常用测试夹具
pub fn test_node(id: &str, transport: TransportKind, weight: i32, max_tasks: i32) -> Node {
    use orchestrator_core::models::NodeRegistration;
    Node::new(NodeRegistration {
        node_id: id.to_string(),
        hostname: format!("host-{id}"),
        ip_address: "127.0.0.1".to_string(),
        port: 9000,
        transport,
        weight,
        max_concurrent_tasks: max_tasks,
    })
}

pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy::default()
}
