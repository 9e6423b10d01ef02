use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use orchestrator_core::models::{RetryPolicy, SubTaskStatus};
use orchestrator_core::traits::{SubTaskRepository, TaskRepository};
use orchestrator_core::OrchestratorResult;

use crate::registry::NodeRegistry;

/// 子任务失败的重试结算
///
/// 分发同步失败与节点异步上报失败走同一条结算路径：释放节点容量，
/// 在预算内按指数退避重新排队，预算耗尽转终态失败。对不在运行态
/// 的子任务（已停止/已结算）一律no-op，吸收迟到事件。
pub struct SubTaskRetryService {
    subtask_repo: Arc<dyn SubTaskRepository>,
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<NodeRegistry>,
    policy: RetryPolicy,
}

impl SubTaskRetryService {
    pub fn new(
        subtask_repo: Arc<dyn SubTaskRepository>,
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<NodeRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            subtask_repo,
            task_repo,
            registry,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 结算一次失败。返回true表示子任务仍会重试
    pub async fn handle_failure(
        &self,
        subtask_id: i64,
        reason: &str,
    ) -> OrchestratorResult<bool> {
        let subtask = match self.subtask_repo.get_by_id(subtask_id).await? {
            Some(subtask) => subtask,
            None => {
                warn!("结算失败时子任务 {} 不存在", subtask_id);
                return Ok(false);
            }
        };

        if subtask.status != SubTaskStatus::Running {
            debug!(
                "子任务 {} 当前状态为 {}，失败事件按迟到no-op处理",
                subtask_id,
                subtask.status.as_str()
            );
            return Ok(false);
        }

        // 失败路径必须归还乐观预留的容量
        if let Some(node_id) = &subtask.node_id {
            self.registry.release(node_id, subtask.source_kind).await?;
        }

        let will_retry = if self.policy.is_exhausted(subtask.retry_count + 1) {
            self.subtask_repo
                .mark_failed_terminal(subtask_id, reason)
                .await?;
            info!(
                "子任务 {} 达到最大重试次数 {}，终态失败: {}",
                subtask_id, self.policy.max_retries, reason
            );
            false
        } else {
            // 第n次失败等待 base·2^(n-1)
            let delay = self.policy.delay_seconds(subtask.retry_count);
            let next_retry_at = Utc::now() + chrono::Duration::seconds(delay as i64);
            self.subtask_repo
                .mark_failed_requeue(subtask_id, reason, next_retry_at)
                .await?;
            info!(
                "子任务 {} 第 {} 次失败，{}秒后重试: {}",
                subtask_id,
                subtask.retry_count + 1,
                delay,
                reason
            );
            true
        };

        self.task_repo.refresh_status(subtask.task_id).await?;
        Ok(will_retry)
    }
}
