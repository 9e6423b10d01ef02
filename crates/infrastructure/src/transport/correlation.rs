use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use orchestrator_core::models::CommandReply;
use orchestrator_core::{OrchestratorError, OrchestratorResult};

/// 关联应答等待表
///
/// 每个在途指令对应一个以correlation_id为键的oneshot通道，由消息
/// 接收端resolve，或由定时器到期后以超时错误收尾。取代忙轮询：
/// 等待方挂起在future上，取消语义显式可见。
#[derive(Default)]
pub struct CorrelationMap {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandReply>>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个等待中的关联ID
    async fn register(&self, correlation_id: &str) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(correlation_id.to_string(), tx);
        rx
    }

    /// 投递节点应答。返回false表示没有等待方（应答迟到或重复），
    /// 事件按no-op丢弃
    pub async fn resolve(&self, reply: CommandReply) -> bool {
        let sender = {
            let mut pending = self.pending.lock().await;
            pending.remove(&reply.correlation_id)
        };
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(
                    "关联ID {} 无等待方，应答按迟到消息丢弃",
                    reply.correlation_id
                );
                false
            }
        }
    }

    /// 在有界窗口内等待应答
    pub async fn wait(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> OrchestratorResult<CommandReply> {
        let rx = self.register(correlation_id).await;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // 发送端被丢弃：等待在关机时被整体取消
                Err(OrchestratorError::MessageQueue(
                    "指令应答等待已被取消".to_string(),
                ))
            }
            Err(_) => {
                // 超时后移除登记，使迟到的应答成为可观测的no-op
                let mut pending = self.pending.lock().await;
                pending.remove(correlation_id);
                Err(OrchestratorError::TransportTimeout(format!(
                    "等待节点应答超时 ({}ms)",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// 关机路径：立即取消全部在途等待
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            debug!("已取消 {} 个在途指令等待", count);
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
