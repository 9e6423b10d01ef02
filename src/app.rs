use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::shutdown::ShutdownManager;

use orchestrator_api::{create_router, AppState};
use orchestrator_core::models::{NodeEvent, RetryPolicy, SourceKind};
use orchestrator_core::AppConfig;
use orchestrator_dispatcher::{
    HealthMonitorConfig, ModelInfo, NodeEventProcessor, NodeHealthMonitor, NodeRegistry,
    StartupRecoveryService, StaticModelCatalog, SubTaskRetryService, TaskController,
    TaskQueueManager, TransportSet, WeightedCapacityStrategy,
};
use orchestrator_infrastructure::{
    connect, initialize_schema, HttpDispatchTransport, MqttDispatchTransport,
    SqliteNodeRepository, SqliteSubTaskRepository, SqliteTaskRepository,
};

/// 应用装配：按依赖顺序构建各组件并运行后台服务
pub struct Application {
    config: AppConfig,
    queue_manager: Arc<TaskQueueManager>,
    health_monitor: Arc<NodeHealthMonitor>,
    event_processor: Arc<NodeEventProcessor>,
    mqtt_transport: Arc<MqttDispatchTransport>,
    api_state: AppState,
    events_rx: Option<mpsc::UnboundedReceiver<NodeEvent>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        // 数据库与表结构
        let pool = connect(&config.database.url, config.database.max_connections)
            .await
            .context("连接数据库失败")?;
        initialize_schema(&pool).await.context("初始化表结构失败")?;

        let node_repo = Arc::new(SqliteNodeRepository::new(pool.clone()));
        let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let subtask_repo = Arc::new(SqliteSubTaskRepository::new(pool));

        let registry = Arc::new(NodeRegistry::new(
            node_repo,
            Arc::new(WeightedCapacityStrategy::new()),
        ));

        // 传输层：节点事件统一汇入一条通道
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mqtt_transport, _event_loop) =
            MqttDispatchTransport::connect(&config.mqtt, events_tx);
        let mqtt_transport = Arc::new(mqtt_transport);
        let http_transport =
            Arc::new(HttpDispatchTransport::new(&config.http_dispatch).context("构建HTTP传输失败")?);
        let transports = Arc::new(TransportSet::new(http_transport, mqtt_transport.clone()));

        let retry_policy = RetryPolicy {
            max_retries: config.dispatcher.max_retries,
            base_delay_seconds: config.dispatcher.base_retry_delay_seconds,
            backoff_factor: 2,
        };
        let retry_service = Arc::new(SubTaskRetryService::new(
            subtask_repo.clone(),
            task_repo.clone(),
            registry.clone(),
            retry_policy,
        ));
        let recovery = Arc::new(StartupRecoveryService::new(
            subtask_repo.clone(),
            task_repo.clone(),
            registry.clone(),
        ));
        let health_monitor = Arc::new(NodeHealthMonitor::new(
            registry.clone(),
            subtask_repo.clone(),
            task_repo.clone(),
            HealthMonitorConfig {
                suspect_threshold_seconds: config.dispatcher.suspect_threshold_seconds,
                heartbeat_timeout_seconds: config.dispatcher.heartbeat_timeout_seconds,
                sweep_interval_seconds: config.dispatcher.health_check_interval_seconds,
                auto_cleanup_offline_nodes: true,
                offline_cleanup_threshold_seconds: config
                    .dispatcher
                    .offline_cleanup_threshold_seconds,
            },
        ));
        let event_processor = Arc::new(NodeEventProcessor::new(
            registry.clone(),
            health_monitor.clone(),
            subtask_repo.clone(),
            task_repo.clone(),
            retry_service.clone(),
        ));
        let queue_manager = Arc::new(TaskQueueManager::new(
            task_repo.clone(),
            subtask_repo.clone(),
            registry.clone(),
            transports.clone(),
            retry_service,
            recovery,
            config.dispatcher.clone(),
        ));

        // 模型目录：模型服务的接入点，这里内置默认目录
        let catalog = Arc::new(StaticModelCatalog::new(default_models()));
        let controller = Arc::new(TaskController::new(
            task_repo,
            subtask_repo,
            registry.clone(),
            transports,
            catalog,
        ));

        let api_state = AppState {
            controller,
            registry,
        };

        Ok(Self {
            config,
            queue_manager,
            health_monitor,
            event_processor,
            mqtt_transport,
            api_state,
            events_rx: Some(events_rx),
        })
    }

    /// 运行所有后台服务，直到收到关闭信号
    pub async fn run(mut self, shutdown: ShutdownManager) -> Result<()> {
        let events_rx = self
            .events_rx
            .take()
            .context("Application::run 只能调用一次")?;

        let mut handles = Vec::new();

        // 事件处理器
        {
            let processor = self.event_processor.clone();
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                processor.run(events_rx, rx).await;
            }));
        }

        // 健康监控
        {
            let monitor = self.health_monitor.clone();
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                monitor.run(rx).await;
            }));
        }

        // 调度循环（内部先跑崩溃恢复）
        if self.config.dispatcher.enabled {
            let manager = self.queue_manager.clone();
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                if let Err(e) = manager.run(rx).await {
                    error!("调度循环异常退出: {}", e);
                }
            }));
        }

        // REST接口
        if self.config.api.enabled {
            let router = create_router(self.api_state.clone());
            let bind_address = self.config.api.bind_address.clone();
            let mut rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                let listener = match tokio::net::TcpListener::bind(&bind_address).await {
                    Ok(listener) => {
                        info!("API服务监听于 {}", bind_address);
                        listener
                    }
                    Err(e) => {
                        error!("绑定API监听地址 {} 失败: {}", bind_address, e);
                        return;
                    }
                };
                let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                    let _ = rx.recv().await;
                });
                if let Err(e) = server.await {
                    error!("API服务异常退出: {}", e);
                }
            }));
        }

        // 等待关闭信号，然后按序收尾
        let mut rx = shutdown.subscribe().await;
        let _ = rx.recv().await;

        // 立即取消在途的pub/sub等待（HTTP调用自然完成或超时）
        self.mqtt_transport.shutdown().await;

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台服务join失败: {}", e);
            }
        }

        info!("所有后台服务已退出");
        Ok(())
    }
}

/// 内置模型目录。接入外部模型服务时替换为其客户端实现
fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            code: "yolov8-person".to_string(),
            name: "人体检测".to_string(),
            supported_kinds: vec![SourceKind::Image, SourceKind::Video, SourceKind::Stream],
        },
        ModelInfo {
            code: "yolov8-vehicle".to_string(),
            name: "车辆检测".to_string(),
            supported_kinds: vec![SourceKind::Image, SourceKind::Video, SourceKind::Stream],
        },
        ModelInfo {
            code: "lpr-v2".to_string(),
            name: "车牌识别".to_string(),
            supported_kinds: vec![SourceKind::Image, SourceKind::Stream],
        },
        ModelInfo {
            code: "fire-smoke".to_string(),
            name: "烟火检测".to_string(),
            supported_kinds: vec![SourceKind::Stream],
        },
    ]
}
