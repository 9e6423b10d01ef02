//! orchestrator-dispatcher
//!
//! 调度核心：节点注册表与选择策略、任务队列管理器、节点健康监控、
//! 事件处理、启动恢复与任务控制器门面。

pub mod controller;
pub mod event_processor;
pub mod health_monitor;
pub mod queue_manager;
pub mod recovery;
pub mod registry;
pub mod retry_service;
pub mod strategies;

#[cfg(test)]
pub mod test_utils;

pub use controller::{
    CreateTaskReport, CreateTaskSpec, ModelCatalog, ModelInfo, StartTaskReport,
    StaticModelCatalog, TaskController, TaskStatusReport,
};
pub use event_processor::NodeEventProcessor;
pub use health_monitor::{HealthMonitorConfig, HealthState, NodeHealthMonitor};
pub use queue_manager::{TaskQueueManager, TransportSet};
pub use recovery::{RecoveryReport, StartupRecoveryService};
pub use registry::NodeRegistry;
pub use retry_service::SubTaskRetryService;
pub use strategies::{NodeSelectionStrategy, WeightedCapacityStrategy};
