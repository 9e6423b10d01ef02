use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orchestrator_core::models::{
    AnalyzeConfig, SourceKind, SourceSpec, SubTask, SubTaskStatus, Task, TaskStatus,
};
use orchestrator_core::traits::{SubTaskRepository, TaskRepository};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::queue_manager::TransportSet;
use crate::registry::NodeRegistry;

/// 模型目录：外部模型服务的只读视图
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn get_model(&self, code: &str) -> OrchestratorResult<Option<ModelInfo>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub code: String,
    pub name: String,
    /// 该模型可分析的源类型
    pub supported_kinds: Vec<SourceKind>,
}

impl ModelInfo {
    pub fn supports(&self, kind: SourceKind) -> bool {
        self.supported_kinds.contains(&kind)
    }
}

/// 静态模型目录
pub struct StaticModelCatalog {
    models: HashMap<String, ModelInfo>,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.code.clone(), m)).collect(),
        }
    }
}

#[async_trait]
impl ModelCatalog for StaticModelCatalog {
    async fn get_model(&self, code: &str) -> OrchestratorResult<Option<ModelInfo>> {
        Ok(self.models.get(code).cloned())
    }
}

/// 创建任务请求
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskSpec {
    pub name: String,
    pub sources: Vec<SourceSpec>,
    pub model_codes: Vec<String>,
    #[serde(default)]
    pub config: AnalyzeConfig,
    #[serde(default)]
    pub priority: i32,
}

/// 创建结果：部分成功是常态而非错误
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskReport {
    pub task: Task,
    pub created_subtasks: usize,
    pub requested_combinations: usize,
    pub warnings: Vec<String>,
}

/// 启动/停止结果："K of N"口径
#[derive(Debug, Clone, Serialize)]
pub struct StartTaskReport {
    pub task_id: i64,
    pub eligible_subtasks: usize,
    pub total_subtasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task: Task,
    pub subtasks: Vec<SubTask>,
}

/// 任务控制器：面向用户的门面
///
/// 创建时按 (源 × 模型) 展开子任务，缺失引用跳过该组合并以警告
/// 上报；启动只是把子任务交还给调度循环准入；停止尽力通知节点但
/// 从不等待确认。
pub struct TaskController {
    task_repo: Arc<dyn TaskRepository>,
    subtask_repo: Arc<dyn SubTaskRepository>,
    registry: Arc<NodeRegistry>,
    transports: Arc<TransportSet>,
    catalog: Arc<dyn ModelCatalog>,
}

impl TaskController {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        subtask_repo: Arc<dyn SubTaskRepository>,
        registry: Arc<NodeRegistry>,
        transports: Arc<TransportSet>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Self {
        Self {
            task_repo,
            subtask_repo,
            registry,
            transports,
            catalog,
        }
    }

    /// 创建任务：每个 (源, 模型) 组合一个子任务。
    /// 缺失的模型或不支持的组合非致命，跳过并记入警告
    pub async fn create_task(&self, spec: CreateTaskSpec) -> OrchestratorResult<CreateTaskReport> {
        if spec.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("任务名不能为空".to_string()));
        }
        if spec.sources.is_empty() || spec.model_codes.is_empty() {
            return Err(OrchestratorError::Validation(
                "任务至少需要一个源和一个模型".to_string(),
            ));
        }
        spec.config.validate()?;

        let requested = spec.sources.len() * spec.model_codes.len();
        let mut warnings = Vec::new();

        // 逐个校验模型引用
        let mut models = HashMap::new();
        for code in &spec.model_codes {
            match self.catalog.get_model(code).await? {
                Some(model) => {
                    models.insert(code.clone(), model);
                }
                None => {
                    warn!("创建任务 {} 时模型 {} 不存在，跳过", spec.name, code);
                    warnings.push(format!("模型 {code} 不存在，相关组合已跳过"));
                }
            }
        }

        // 校验源并展开组合
        let mut combinations = Vec::new();
        for source in &spec.sources {
            if source.url.trim().is_empty() {
                warnings.push(format!("{} 源地址为空，相关组合已跳过", source.kind.as_str()));
                continue;
            }
            for code in &spec.model_codes {
                let Some(model) = models.get(code) else {
                    continue;
                };
                if !model.supports(source.kind) {
                    warnings.push(format!(
                        "模型 {} 不支持 {} 源，该组合已跳过",
                        code,
                        source.kind.as_str()
                    ));
                    continue;
                }
                combinations.push((source.clone(), code.clone()));
            }
        }

        if combinations.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "任务 {} 没有任何可用的 (源, 模型) 组合: {}",
                spec.name,
                warnings.join("; ")
            )));
        }

        let mut task = Task::new(spec.name.clone());
        task.total_subtasks = combinations.len() as i32;
        let task = self.task_repo.create(&task).await?;

        for (source, model_code) in &combinations {
            let mut subtask = SubTask::new(
                task.id,
                source.kind,
                source.url.clone(),
                model_code.clone(),
            );
            subtask.config = spec.config.clone();
            subtask.priority = spec.priority;
            self.subtask_repo.create(&subtask).await?;
        }

        info!(
            "任务 {} 创建完成: {}/{} 个子任务 ({}个警告)",
            task.id,
            combinations.len(),
            requested,
            warnings.len()
        );

        Ok(CreateTaskReport {
            task,
            created_subtasks: combinations.len(),
            requested_combinations: requested,
            warnings,
        })
    }

    /// 启动任务：复位停止态子任务，交给调度循环准入。
    /// 先前绑定的节点已在停止/回收时清除，重新选择是自动的。
    /// 部分子任务不可启动（已终态失败）是正常结果
    pub async fn start_task(&self, task_id: i64) -> OrchestratorResult<StartTaskReport> {
        let _task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })?;

        let revived = self.subtask_repo.revive_stopped(task_id).await?;
        if revived > 0 {
            info!("任务 {} 重启：复位了 {} 个停止态子任务", task_id, revived);
        }

        let subtasks = self.subtask_repo.get_by_task_id(task_id).await?;
        let eligible = subtasks
            .iter()
            .filter(|st| st.status == SubTaskStatus::Pending)
            .count();

        self.task_repo.mark_started(task_id).await?;
        self.task_repo.refresh_status(task_id).await?;

        info!(
            "任务 {} 启动: {}/{} 个子任务待调度",
            task_id,
            eligible,
            subtasks.len()
        );
        Ok(StartTaskReport {
            task_id,
            eligible_subtasks: eligible,
            total_subtasks: subtasks.len(),
        })
    }

    /// 停止任务：所有非终态子任务转STOPPED，尽力通知承载节点，
    /// 不等待节点确认
    pub async fn stop_task(&self, task_id: i64) -> OrchestratorResult<StartTaskReport> {
        let _task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })?;

        let subtasks = self.subtask_repo.get_by_task_id(task_id).await?;
        let mut stopped = 0;

        for subtask in &subtasks {
            if subtask.status.is_terminal() {
                continue;
            }
            let node_id = subtask.node_id.clone();
            if !self.subtask_repo.mark_stopped(subtask.id).await? {
                continue;
            }
            stopped += 1;

            // 运行中的子任务：归还容量并尽力通知节点
            if let Some(node_id) = node_id {
                self.registry.release(&node_id, subtask.source_kind).await?;
                if let Some(node) = self.registry.get_node(&node_id).await? {
                    let transport = self.transports.for_kind(node.transport);
                    if let Err(e) = transport.stop(&node, task_id, subtask.id).await {
                        warn!(
                            "通知节点 {} 停止子任务 {} 失败（忽略）: {}",
                            node_id, subtask.id, e
                        );
                    }
                }
            }
        }

        self.task_repo.refresh_status(task_id).await?;
        self.task_repo
            .mark_stopped(task_id, Some("任务已被用户停止"))
            .await?;

        info!("任务 {} 停止: {}/{} 个子任务被停止", task_id, stopped, subtasks.len());
        Ok(StartTaskReport {
            task_id,
            eligible_subtasks: stopped,
            total_subtasks: subtasks.len(),
        })
    }

    /// 迁移任务：停止 → （调度循环自动重新选择节点） → 重启
    pub async fn migrate_task(&self, task_id: i64) -> OrchestratorResult<StartTaskReport> {
        info!("迁移任务 {}: 先停止再重新调度", task_id);
        self.stop_task(task_id).await?;
        self.start_task(task_id).await
    }

    /// 删除任务：运行中的任务必须先停止
    pub async fn delete_task(&self, task_id: i64) -> OrchestratorResult<()> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })?;
        if task.status == TaskStatus::Running {
            return Err(OrchestratorError::Validation(format!(
                "任务 {task_id} 正在运行，请先停止再删除"
            )));
        }
        self.task_repo.delete(task_id).await
    }

    /// 任务状态聚合：主任务 + 全部子任务明细
    pub async fn get_task_status(&self, task_id: i64) -> OrchestratorResult<TaskStatusReport> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })?;
        let subtasks = self.subtask_repo.get_by_task_id(task_id).await?;
        Ok(TaskStatusReport { task, subtasks })
    }

    pub async fn list_tasks(&self) -> OrchestratorResult<Vec<Task>> {
        self.task_repo.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::WeightedCapacityStrategy;
    use crate::test_utils::{test_node, MemoryLedger, MockTransport};
    use orchestrator_core::models::{SourceKind, TransportKind};
    use orchestrator_core::traits::NodeRepository as _;

    fn catalog() -> Arc<StaticModelCatalog> {
        Arc::new(StaticModelCatalog::new(vec![
            ModelInfo {
                code: "yolov8-person".to_string(),
                name: "人体检测".to_string(),
                supported_kinds: vec![SourceKind::Image, SourceKind::Video, SourceKind::Stream],
            },
            ModelInfo {
                code: "lpr-v2".to_string(),
                name: "车牌识别".to_string(),
                // 不支持视频文件
                supported_kinds: vec![SourceKind::Image, SourceKind::Stream],
            },
        ]))
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        controller: TaskController,
        mqtt: Arc<MockTransport>,
    }

    async fn fixture() -> Fixture {
        let ledger = MemoryLedger::new();
        let registry = Arc::new(NodeRegistry::new(
            ledger.node_repo(),
            Arc::new(WeightedCapacityStrategy::new()),
        ));
        let http = Arc::new(MockTransport::new(TransportKind::Http));
        let mqtt = Arc::new(MockTransport::new(TransportKind::Mqtt));
        let transports = Arc::new(TransportSet::new(http, mqtt.clone()));
        let controller = TaskController::new(
            ledger.task_repo(),
            ledger.subtask_repo(),
            registry,
            transports,
            catalog(),
        );
        Fixture {
            ledger,
            controller,
            mqtt,
        }
    }

    fn stream_source(url: &str) -> SourceSpec {
        SourceSpec {
            kind: SourceKind::Stream,
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_task_full_fanout() {
        let fx = fixture().await;
        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "路口监控".to_string(),
                sources: vec![stream_source("rtsp://a"), stream_source("rtsp://b")],
                model_codes: vec!["yolov8-person".to_string(), "lpr-v2".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();

        assert_eq!(report.created_subtasks, 4);
        assert_eq!(report.requested_combinations, 4);
        assert!(report.warnings.is_empty());
        assert_eq!(report.task.total_subtasks, 4);

        let subtasks = fx
            .ledger
            .subtask_repo()
            .get_by_task_id(report.task.id)
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 4);
        assert!(subtasks.iter().all(|st| st.status == SubTaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_create_task_missing_model_is_partial_success() {
        // Scenario D变体：缺失的模型引用非致命，跳过并警告点名
        let fx = fixture().await;
        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "夜间巡检".to_string(),
                sources: vec![stream_source("rtsp://a"), stream_source("rtsp://b")],
                model_codes: vec!["yolov8-person".to_string(), "ghost-model".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();

        assert_eq!(report.created_subtasks, 2);
        assert_eq!(report.requested_combinations, 4);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("ghost-model"));
    }

    #[tokio::test]
    async fn test_create_task_unsupported_combination_skipped() {
        // Scenario D: 2源 × 2模型，其中1个组合缺失 → total_subtasks=3
        let fx = fixture().await;
        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "混合分析".to_string(),
                sources: vec![
                    stream_source("rtsp://gate"),
                    SourceSpec {
                        kind: SourceKind::Video,
                        url: "http://files/rec.mp4".to_string(),
                    },
                ],
                model_codes: vec!["yolov8-person".to_string(), "lpr-v2".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();

        // lpr-v2不支持video源：4个组合里3个成立
        assert_eq!(report.created_subtasks, 3);
        assert_eq!(report.task.total_subtasks, 3);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("lpr-v2"));
    }

    #[tokio::test]
    async fn test_create_task_no_valid_combination_is_error() {
        let fx = fixture().await;
        let result = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "全部缺失".to_string(),
                sources: vec![stream_source("rtsp://a")],
                model_codes: vec!["ghost-model".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_stop_task_notifies_nodes_and_releases_capacity() {
        let fx = fixture().await;
        fx.ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();

        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "停止测试".to_string(),
                sources: vec![stream_source("rtsp://a"), stream_source("rtsp://b")],
                model_codes: vec!["yolov8-person".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();
        let task_id = report.task.id;
        let subtasks = fx.ledger.subtask_repo().get_by_task_id(task_id).await.unwrap();

        // 一个子任务已在节点上运行，另一个仍在排队
        fx.ledger
            .node_repo()
            .try_reserve_slot("n1", SourceKind::Stream)
            .await
            .unwrap();
        fx.ledger
            .subtask_repo()
            .mark_running(subtasks[0].id, "n1")
            .await
            .unwrap();

        let stop = fx.controller.stop_task(task_id).await.unwrap();
        assert_eq!(stop.eligible_subtasks, 2);

        // 运行中的那个收到了停止通知；排队中的那个即刻停止无需通知
        let notified = fx.mqtt.stopped.lock().unwrap().clone();
        assert_eq!(notified, vec![("n1".to_string(), subtasks[0].id)]);

        // 容量已归还
        let node = fx.ledger.node_repo().get_by_id("n1").await.unwrap().unwrap();
        assert_eq!(node.current_task_count, 0);

        let task = fx.ledger.task_repo().get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        assert_eq!(task.error_message.as_deref(), Some("任务已被用户停止"));
    }

    #[tokio::test]
    async fn test_migrate_task_revives_subtasks_for_rescheduling() {
        let fx = fixture().await;
        fx.ledger
            .node_repo()
            .register(&test_node("n1", TransportKind::Mqtt, 5, 4))
            .await
            .unwrap();
        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "迁移测试".to_string(),
                sources: vec![stream_source("rtsp://a")],
                model_codes: vec!["yolov8-person".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();
        let task_id = report.task.id;
        let st = &fx.ledger.subtask_repo().get_by_task_id(task_id).await.unwrap()[0];
        fx.ledger
            .subtask_repo()
            .mark_running(st.id, "n1")
            .await
            .unwrap();

        let migrated = fx.controller.migrate_task(task_id).await.unwrap();
        assert_eq!(migrated.eligible_subtasks, 1, "迁移后子任务重新可调度");

        let stored = fx.ledger.subtask_repo().get_by_id(st.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubTaskStatus::Pending);
        assert!(stored.node_id.is_none(), "迁移后由调度循环重新选择节点");
    }

    #[tokio::test]
    async fn test_delete_running_task_rejected() {
        let fx = fixture().await;
        let report = fx
            .controller
            .create_task(CreateTaskSpec {
                name: "删除测试".to_string(),
                sources: vec![stream_source("rtsp://a")],
                model_codes: vec!["yolov8-person".to_string()],
                config: AnalyzeConfig::default(),
                priority: 0,
            })
            .await
            .unwrap();
        let task_id = report.task.id;
        let st = &fx.ledger.subtask_repo().get_by_task_id(task_id).await.unwrap()[0];
        fx.ledger
            .subtask_repo()
            .mark_running(st.id, "n1")
            .await
            .unwrap();
        fx.ledger.task_repo().refresh_status(task_id).await.unwrap();

        assert!(fx.controller.delete_task(task_id).await.is_err());

        fx.controller.stop_task(task_id).await.unwrap();
        fx.controller.delete_task(task_id).await.unwrap();
        assert!(fx.ledger.task_repo().get_by_id(task_id).await.unwrap().is_none());
    }
}
