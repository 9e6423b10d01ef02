use thiserror::Error;

/// 编排器统一错误类型
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("子任务未找到: {id}")]
    SubTaskNotFound { id: i64 },

    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },

    /// 没有符合条件的在线节点。调度器将其视为背压而非硬错误
    #[error("没有可用节点")]
    NoAvailableNode,

    #[error("分发超时: {0}")]
    TransportTimeout(String),

    #[error("节点拒绝任务: {0}")]
    TransportRejected(String),

    #[error("节点不可达: {0}")]
    TransportUnreachable(String),

    /// 节点失联导致任务被回收，不计入子任务重试预算
    #[error("节点失联: {id}")]
    NodeLost { id: String },

    #[error("非法状态迁移: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("校验错误: {0}")]
    Validation(String),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// 该错误是否应当触发子任务的重试/退避流程
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransportTimeout(_)
                | OrchestratorError::TransportRejected(_)
                | OrchestratorError::TransportUnreachable(_)
                | OrchestratorError::MessageQueue(_)
        )
    }

    /// 简短的错误分类标签，写入子任务error_message
    pub fn kind_label(&self) -> &'static str {
        match self {
            OrchestratorError::NoAvailableNode => "NoAvailableNode",
            OrchestratorError::TransportTimeout(_) => "TransportTimeout",
            OrchestratorError::TransportRejected(_) => "TransportRejected",
            OrchestratorError::TransportUnreachable(_) => "TransportUnreachable",
            OrchestratorError::NodeLost { .. } => "NodeLost",
            OrchestratorError::Validation(_) => "ValidationError",
            OrchestratorError::Database(_) | OrchestratorError::DatabaseOperation(_) => {
                "PersistenceError"
            }
            _ => "Internal",
        }
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
