use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use orchestrator_core::traits::{SubTaskRepository, TaskRepository};
use orchestrator_core::OrchestratorResult;

use crate::registry::NodeRegistry;

/// 崩溃恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub recovered_subtasks: Vec<i64>,
    pub affected_tasks: Vec<i64>,
}

/// 启动期恢复服务
///
/// 进程重启后台账里残留的RUNNING子任务已经没有对应的在途分发，
/// 全部复位为PENDING并释放其占用的节点容量。必须在调度循环开始
/// 准入之前执行完毕，否则会与新分发重复计数。
pub struct StartupRecoveryService {
    subtask_repo: Arc<dyn SubTaskRepository>,
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<NodeRegistry>,
}

impl StartupRecoveryService {
    pub fn new(
        subtask_repo: Arc<dyn SubTaskRepository>,
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            subtask_repo,
            task_repo,
            registry,
        }
    }

    /// 恢复孤儿子任务。按创建顺序复位，保证重新准入时的FIFO顺序
    pub async fn recover(&self) -> OrchestratorResult<RecoveryReport> {
        let running = self.subtask_repo.get_all_running().await?;
        if running.is_empty() {
            info!("启动恢复：没有需要恢复的运行中子任务");
            return Ok(RecoveryReport::default());
        }

        info!("启动恢复：发现 {} 个孤儿RUNNING子任务", running.len());
        let mut report = RecoveryReport::default();
        let mut task_ids = BTreeSet::new();

        for subtask in running {
            let node_id = subtask.node_id.clone();
            let reset = self
                .subtask_repo
                .reset_to_pending(subtask.id, "进程重启，子任务重新排队")
                .await?;
            if !reset {
                continue;
            }
            // 释放崩溃前预留的节点容量
            if let Some(node_id) = &node_id {
                if let Err(e) = self.registry.release(node_id, subtask.source_kind).await {
                    warn!("释放节点 {} 容量失败: {}", node_id, e);
                }
            }
            report.recovered_subtasks.push(subtask.id);
            task_ids.insert(subtask.task_id);
        }

        for task_id in task_ids {
            self.task_repo.refresh_status(task_id).await?;
            report.affected_tasks.push(task_id);
        }

        info!(
            "启动恢复完成：{} 个子任务复位，涉及 {} 个任务",
            report.recovered_subtasks.len(),
            report.affected_tasks.len()
        );
        Ok(report)
    }
}
