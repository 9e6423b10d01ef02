use async_trait::async_trait;
use tracing::debug;

use orchestrator_core::models::{Node, SourceKind};
use orchestrator_core::OrchestratorResult;

/// 节点选择策略
#[async_trait]
pub trait NodeSelectionStrategy: Send + Sync {
    /// 从候选节点中选择一个承载指定类型的子任务。
    /// 返回None表示当前无可用节点，调用方按背压处理
    async fn select(
        &self,
        kind: SourceKind,
        candidates: &[Node],
    ) -> OrchestratorResult<Option<Node>>;

    fn name(&self) -> &str;
}

/// 加权容量策略
///
/// 候选条件：在线、启用、load < max。
/// 得分 = clamp(weight/10, 0.1, 1.0) × (1 − 负载率)，取最高分；
/// 同分先取绝对负载更低者，再按节点ID升序保证确定性。
pub struct WeightedCapacityStrategy;

impl WeightedCapacityStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedCapacityStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeSelectionStrategy for WeightedCapacityStrategy {
    async fn select(
        &self,
        kind: SourceKind,
        candidates: &[Node],
    ) -> OrchestratorResult<Option<Node>> {
        let mut eligible: Vec<&Node> = candidates.iter().filter(|n| n.has_capacity()).collect();

        if eligible.is_empty() {
            debug!("没有可承载 {} 子任务的在线节点", kind.as_str());
            return Ok(None);
        }

        eligible.sort_by(|a, b| {
            b.dispatch_score()
                .partial_cmp(&a.dispatch_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.current_task_count.cmp(&b.current_task_count))
                .then(a.id.cmp(&b.id))
        });

        let selected = eligible[0];
        debug!(
            "加权容量策略选择节点: {} (得分: {:.3}, 负载: {}/{})",
            selected.id,
            selected.dispatch_score(),
            selected.current_task_count,
            selected.max_concurrent_tasks
        );

        Ok(Some(selected.clone()))
    }

    fn name(&self) -> &str {
        "WeightedCapacity"
    }
}
