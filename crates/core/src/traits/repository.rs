//! 数据仓储层接口定义
//!
//! 三个仓储接口分别负责节点、任务、子任务的持久化。所有实现必须
//! `Send + Sync`，所有状态变更通过单条带条件的UPDATE语句或事务完成，
//! 调度路径上不允许读-改-写竞态。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::OrchestratorResult;
use crate::models::{
    Node, NodeHeartbeat, NodeStatus, SourceKind, SubTask, SubTaskCounts, Task, TaskStatus,
};

/// 节点仓储接口
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// 注册节点：按节点标识幂等upsert
    async fn register(&self, node: &Node) -> OrchestratorResult<()>;

    /// 显式注销，删除节点记录
    async fn unregister(&self, node_id: &str) -> OrchestratorResult<()>;

    async fn get_by_id(&self, node_id: &str) -> OrchestratorResult<Option<Node>>;

    async fn list(&self) -> OrchestratorResult<Vec<Node>>;

    /// 在线且启用的节点
    async fn get_online_nodes(&self) -> OrchestratorResult<Vec<Node>>;

    async fn update_status(&self, node_id: &str, status: NodeStatus) -> OrchestratorResult<()>;

    /// 刷新心跳时间与资源指标，并将节点置为在线
    async fn update_heartbeat(&self, heartbeat: &NodeHeartbeat) -> OrchestratorResult<()>;

    /// 原子预留一个任务槽位
    ///
    /// 单条条件UPDATE：仅当 current < max 时递增，返回是否预留成功。
    /// 这是并发分发唯一共享的计数，绝不允许读-改-写。
    async fn try_reserve_slot(&self, node_id: &str, kind: SourceKind)
        -> OrchestratorResult<bool>;

    /// 释放一个任务槽位（计数不会降到0以下）
    async fn release_slot(&self, node_id: &str, kind: SourceKind) -> OrchestratorResult<()>;

    /// 运维开关：停用的节点不参与调度
    async fn set_active(&self, node_id: &str, active: bool) -> OrchestratorResult<()>;
}

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> OrchestratorResult<Task>;

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<Task>>;

    async fn list(&self) -> OrchestratorResult<Vec<Task>>;

    async fn delete(&self, id: i64) -> OrchestratorResult<()>;

    async fn mark_started(&self, id: i64) -> OrchestratorResult<()>;

    async fn mark_stopped(&self, id: i64, error_message: Option<&str>) -> OrchestratorResult<()>;

    /// 在单个事务内重新聚合子任务计数并回写派生状态
    ///
    /// 所有子任务状态变更后都应调用此方法，避免并发更新下的
    /// 计数漂移（用户主动停止的任务保持stopped不被覆盖为pending）。
    async fn refresh_status(&self, id: i64) -> OrchestratorResult<(TaskStatus, SubTaskCounts)>;
}

/// 子任务仓储接口
///
/// 带状态前提的更新方法返回bool表示是否实际生效：迟到的完成/失败
/// 事件命中已终态的子任务时必须是无副作用的no-op。
#[async_trait]
pub trait SubTaskRepository: Send + Sync {
    async fn create(&self, subtask: &SubTask) -> OrchestratorResult<SubTask>;

    async fn get_by_id(&self, id: i64) -> OrchestratorResult<Option<SubTask>>;

    async fn get_by_task_id(&self, task_id: i64) -> OrchestratorResult<Vec<SubTask>>;

    /// 到期可调度的PENDING子任务，按优先级降序、创建时间升序（FIFO）
    async fn get_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> OrchestratorResult<Vec<SubTask>>;

    async fn get_running_by_node(&self, node_id: &str) -> OrchestratorResult<Vec<SubTask>>;

    async fn get_all_running(&self) -> OrchestratorResult<Vec<SubTask>>;

    /// PENDING → RUNNING，绑定节点。返回false说明子任务已不在PENDING
    /// （被停止或已被其他分发占用），保证每个子任务至多一次在途分发
    async fn mark_running(&self, id: i64, node_id: &str) -> OrchestratorResult<bool>;

    /// RUNNING → COMPLETED。迟到事件no-op
    async fn mark_completed(&self, id: i64) -> OrchestratorResult<bool>;

    /// RUNNING → PENDING，递增重试计数并设置退避闸门。迟到事件no-op
    async fn mark_failed_requeue(
        &self,
        id: i64,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> OrchestratorResult<bool>;

    /// RUNNING/PENDING → FAILED 终态
    async fn mark_failed_terminal(&self, id: i64, reason: &str) -> OrchestratorResult<bool>;

    /// {PENDING, RUNNING} → STOPPED
    async fn mark_stopped(&self, id: i64) -> OrchestratorResult<bool>;

    /// 恢复路径：RUNNING → PENDING，清除节点与开始时间，
    /// 不消耗重试预算（节点失联时任务并未获得公平的执行机会）
    async fn reset_to_pending(&self, id: i64, reason: &str) -> OrchestratorResult<bool>;

    /// 仅更新错误说明，用于"无可用节点"这类背压提示
    async fn set_error_message(&self, id: i64, reason: &str) -> OrchestratorResult<()>;

    /// 用户重启/迁移路径：把任务下所有STOPPED子任务复位为PENDING，
    /// 重试计数清零（视作一次全新的准入），返回复位数量
    async fn revive_stopped(&self, task_id: i64) -> OrchestratorResult<u64>;

    async fn count_by_status(&self, task_id: i64) -> OrchestratorResult<SubTaskCounts>;
}
