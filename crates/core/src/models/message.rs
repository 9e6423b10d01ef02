use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::node::{NodeHeartbeat, NodeRegistration};
use crate::models::work_order::WorkOrder;

/// 指令信封：仅在pub/sub分发的等待窗口内存活，从不持久化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub message_id: String,
    /// 不透明关联令牌，节点应答时原样回传
    pub correlation_id: String,
    pub request_type: String,
    /// 节点应答的目标主题
    pub reply_topic: String,
    pub data: CommandPayload,
}

/// 下发给节点的指令载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd_type")]
pub enum CommandPayload {
    #[serde(rename = "start_task")]
    StartTask(WorkOrder),
    #[serde(rename = "stop_task")]
    StopTask { task_id: i64, subtask_id: i64 },
}

/// 节点对指令的关联应答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub message_id: String,
    pub correlation_id: String,
    pub status: ReplyStatus,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,
}

/// 节点上下线通告（connection主题）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAnnouncement {
    pub node_id: String,
    pub status: LifecycleStatus,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default = "default_max_tasks")]
    pub max_concurrent_tasks: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
    pub timestamp: DateTime<Utc>,
}

fn default_max_tasks() -> i32 {
    4
}

fn default_weight() -> i32 {
    5
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleStatus {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "offline")]
    Offline,
}

/// 节点回传的任务结果（result主题 / HTTP回调）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultEvent {
    pub task_id: i64,
    pub subtask_id: i64,
    pub status: ResultStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResultStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

/// 健康监控与结果处理消费的统一节点事件流
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Connected(NodeRegistration),
    Disconnected { node_id: String },
    Heartbeat(NodeHeartbeat),
    TaskResult(TaskResultEvent),
    /// 等待窗口外到达的start_task错误应答：节点放弃了指定子任务，
    /// 仅对该子任务做回收重排
    SubTaskFailureReply { subtask_id: i64, message: String },
}

impl DispatchEnvelope {
    /// 生成不带连字符的16位关联令牌
    fn new_correlation_id() -> String {
        let simple = Uuid::new_v4().simple().to_string();
        simple[..16].to_string()
    }

    pub fn start_task(order: WorkOrder, reply_topic: &str) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Self::new_correlation_id(),
            request_type: "task_cmd".to_string(),
            reply_topic: reply_topic.to_string(),
            data: CommandPayload::StartTask(order),
        }
    }

    pub fn stop_task(task_id: i64, subtask_id: i64, reply_topic: &str) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Self::new_correlation_id(),
            request_type: "task_cmd".to_string(),
            reply_topic: reply_topic.to_string(),
            data: CommandPayload::StopTask {
                task_id,
                subtask_id,
            },
        }
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl CommandReply {
    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// 节点给出的拒绝/失败原因
    pub fn error_message(&self) -> String {
        self.data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("未知错误")
            .to_string()
    }
}
