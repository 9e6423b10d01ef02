use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 分析节点信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// 节点标识：MQTT节点使用MAC/client-id，HTTP节点使用 ip:port
    pub id: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: i32,
    pub transport: TransportKind,
    pub status: NodeStatus,
    /// 调度权重（1-10），参与节点打分
    pub weight: i32,
    pub max_concurrent_tasks: i32,
    pub current_task_count: i32,
    pub image_task_count: i32,
    pub video_task_count: i32,
    pub stream_task_count: i32,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    /// 运维开关，false时节点不参与调度
    pub is_active: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// 节点状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "offline")]
    Offline,
}

/// 节点接入方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportKind {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "mqtt")]
    Mqtt,
}

impl sqlx::Type<sqlx::Sqlite> for NodeStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for NodeStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            _ => Err(format!("Invalid node status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for NodeStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        };
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(s, buf)
    }
}

impl sqlx::Type<sqlx::Sqlite> for TransportKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TransportKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "http" => Ok(TransportKind::Http),
            "mqtt" => Ok(TransportKind::Mqtt),
            _ => Err(format!("Invalid transport kind: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TransportKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            TransportKind::Http => "http",
            TransportKind::Mqtt => "mqtt",
        };
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(s, buf)
    }
}

/// 节点注册信息（来自上线通告或HTTP注册接口）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: i32,
    pub transport: TransportKind,
    #[serde(default = "default_weight")]
    pub weight: i32,
    pub max_concurrent_tasks: i32,
}

fn default_weight() -> i32 {
    5
}

/// 节点心跳/状态上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub current_task_count: i32,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub gpu_usage: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Node {
    /// 根据注册信息创建节点
    pub fn new(registration: NodeRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.node_id,
            hostname: registration.hostname,
            ip_address: registration.ip_address,
            port: registration.port,
            transport: registration.transport,
            status: NodeStatus::Online,
            weight: registration.weight,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_task_count: 0,
            image_task_count: 0,
            video_task_count: 0,
            stream_task_count: 0,
            cpu_usage: None,
            memory_usage: None,
            gpu_usage: None,
            is_active: true,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self.status, NodeStatus::Online)
    }

    /// 是否还能接收新的子任务
    pub fn has_capacity(&self) -> bool {
        self.is_online() && self.is_active && self.current_task_count < self.max_concurrent_tasks
    }

    /// 负载率（当前任务数 / 最大并发数），max为0时视为满载
    pub fn load_fraction(&self) -> f64 {
        if self.max_concurrent_tasks <= 0 {
            1.0
        } else {
            self.current_task_count as f64 / self.max_concurrent_tasks as f64
        }
    }

    /// 调度得分：clamp(weight/10, 0.1, 1.0) × (1 − 负载率)
    pub fn dispatch_score(&self) -> f64 {
        let weight_factor = (self.weight as f64 / 10.0).clamp(0.1, 1.0);
        weight_factor * (1.0 - self.load_fraction())
    }

    /// HTTP节点的基础URL
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip_address, self.port)
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, timeout_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}
