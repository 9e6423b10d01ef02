use async_trait::async_trait;

use crate::errors::OrchestratorResult;
use crate::models::{Node, TransportKind, WorkOrder};

/// 分发确认：节点受理工单后返回其本地任务标识
#[derive(Debug, Clone)]
pub struct DispatchAck {
    pub node_task_id: Option<String>,
}

/// 分发传输通道抽象
///
/// 两种实现：HTTP同步调用、MQTT指令/应答（关联ID + 有界等待）。
/// 调用方在分发前已乐观预留节点容量，任何返回Err的路径都必须由
/// 调用方释放该预留。
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    /// 该通道服务的节点接入方式
    fn kind(&self) -> TransportKind;

    /// 发送工单。错误类型见 OrchestratorError 的分发错误族：
    /// TransportTimeout / TransportRejected / TransportUnreachable
    async fn dispatch(&self, node: &Node, order: &WorkOrder) -> OrchestratorResult<DispatchAck>;

    /// 通知节点停止子任务。尽力而为，不等待确认
    async fn stop(&self, node: &Node, task_id: i64, subtask_id: i64) -> OrchestratorResult<()>;
}
