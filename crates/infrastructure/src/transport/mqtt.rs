use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orchestrator_core::config::MqttConfig;
use orchestrator_core::models::{
    CommandReply, ConnectionAnnouncement, DispatchEnvelope, LifecycleStatus, Node, NodeEvent,
    NodeHeartbeat, NodeRegistration, TaskResultEvent, TransportKind, WorkOrder,
};
use orchestrator_core::traits::{DispatchAck, DispatchTransport};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

use crate::transport::correlation::CorrelationMap;

/// 主题方案
///
/// {prefix}nodes/connection      节点上下线通告
/// {prefix}nodes/{id}/command    编排器 → 节点指令
/// {prefix}nodes/{id}/status     节点心跳/资源状态
/// {prefix}nodes/{id}/result     节点任务结果
/// {prefix}replies               共享应答主题，按correlation_id关联
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn connection(&self) -> String {
        format!("{}nodes/connection", self.prefix)
    }

    pub fn command(&self, node_id: &str) -> String {
        format!("{}nodes/{}/command", self.prefix, node_id)
    }

    pub fn status_wildcard(&self) -> String {
        format!("{}nodes/+/status", self.prefix)
    }

    pub fn result_wildcard(&self) -> String {
        format!("{}nodes/+/result", self.prefix)
    }

    pub fn result(&self, node_id: &str) -> String {
        format!("{}nodes/{}/result", self.prefix, node_id)
    }

    pub fn replies(&self) -> String {
        format!("{}replies", self.prefix)
    }

    fn is_status(&self, topic: &str) -> bool {
        topic.starts_with(&self.prefix) && topic.ends_with("/status")
    }

    fn is_result(&self, topic: &str) -> bool {
        topic.starts_with(&self.prefix) && topic.ends_with("/result")
    }
}

/// 入站消息路由：把broker推来的publish分拣为类型化节点事件，
/// 或resolve在途的指令等待
pub struct MessageRouter {
    topics: TopicScheme,
    correlations: Arc<CorrelationMap>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl MessageRouter {
    pub fn new(
        topics: TopicScheme,
        correlations: Arc<CorrelationMap>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            topics,
            correlations,
            events,
        }
    }

    pub async fn route(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.replies() {
            match CommandReply::deserialize_bytes(payload) {
                Ok(reply) => {
                    let claimed = self.correlations.resolve(reply.clone()).await;
                    if !claimed {
                        self.handle_unclaimed_reply(reply);
                    }
                }
                Err(e) => warn!("解析指令应答失败: {}", e),
            }
            return;
        }

        if topic == self.topics.connection() {
            match serde_json::from_slice::<ConnectionAnnouncement>(payload) {
                Ok(announcement) => self.handle_connection(announcement),
                Err(e) => warn!("解析节点连接通告失败: {}", e),
            }
            return;
        }

        if self.topics.is_status(topic) {
            match serde_json::from_slice::<NodeHeartbeat>(payload) {
                Ok(heartbeat) => {
                    let _ = self.events.send(NodeEvent::Heartbeat(heartbeat));
                }
                Err(e) => warn!("解析节点心跳失败: {} (主题: {})", e, topic),
            }
            return;
        }

        if self.topics.is_result(topic) {
            match serde_json::from_slice::<TaskResultEvent>(payload) {
                Ok(result) => {
                    let _ = self.events.send(NodeEvent::TaskResult(result));
                }
                Err(e) => warn!("解析任务结果失败: {} (主题: {})", e, topic),
            }
            return;
        }

        debug!("忽略未知主题的消息: {}", topic);
    }

    /// 等待窗口外到达的错误应答：若其载荷指明了子任务，说明节点在
    /// 受理后又放弃了该子任务，转成回收事件交给健康监控做定向重排
    fn handle_unclaimed_reply(&self, reply: CommandReply) {
        if reply.is_success() {
            return;
        }
        let cmd_type = reply.data.get("cmd_type").and_then(|v| v.as_str());
        let subtask_id = reply.data.get("subtask_id").and_then(|v| v.as_i64());
        if let (Some("start_task"), Some(subtask_id)) = (cmd_type, subtask_id) {
            let _ = self.events.send(NodeEvent::SubTaskFailureReply {
                subtask_id,
                message: reply.error_message(),
            });
        }
    }

    fn handle_connection(&self, announcement: ConnectionAnnouncement) {
        let event = match announcement.status {
            LifecycleStatus::Online => NodeEvent::Connected(NodeRegistration {
                node_id: announcement.node_id,
                hostname: announcement.hostname,
                ip_address: announcement.ip_address,
                port: announcement.port,
                transport: TransportKind::Mqtt,
                weight: announcement.weight,
                max_concurrent_tasks: announcement.max_concurrent_tasks,
            }),
            LifecycleStatus::Offline => NodeEvent::Disconnected {
                node_id: announcement.node_id,
            },
        };
        let _ = self.events.send(event);
    }
}

/// MQTT分发传输
///
/// 指令发布到节点专属command主题，节点在共享replies主题上按
/// correlation_id应答；等待窗口有界，超时即失败。
pub struct MqttDispatchTransport {
    client: AsyncClient,
    topics: TopicScheme,
    correlations: Arc<CorrelationMap>,
    reply_timeout: Duration,
}

impl MqttDispatchTransport {
    /// 连接broker并启动事件循环
    ///
    /// 返回传输实例与事件循环句柄；入站节点事件写入events通道，
    /// 由健康监控与结果处理消费。
    pub fn connect(
        config: &MqttConfig,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let topics = TopicScheme::new(&config.topic_prefix);
        let correlations = Arc::new(CorrelationMap::new());
        let router = MessageRouter::new(topics.clone(), correlations.clone(), events);

        let subscribe_client = client.clone();
        let subscribe_topics = topics.clone();
        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("已连接到MQTT Broker，订阅节点主题");
                        // 每次(重)连成功后重新订阅
                        let subscriptions = [
                            subscribe_topics.connection(),
                            subscribe_topics.replies(),
                            subscribe_topics.status_wildcard(),
                            subscribe_topics.result_wildcard(),
                        ];
                        for topic in subscriptions {
                            if let Err(e) =
                                subscribe_client.subscribe(&topic, QoS::AtLeastOnce).await
                            {
                                error!("订阅主题 {} 失败: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        router.route(&publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("MQTT Broker主动断开连接");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT连接错误: {}，等待重连", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let transport = Self {
            client,
            topics,
            correlations,
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
        };
        (transport, handle)
    }

    /// 关机：取消全部在途等待并断开连接
    pub async fn shutdown(&self) {
        self.correlations.cancel_all().await;
        if let Err(e) = self.client.disconnect().await {
            debug!("断开MQTT连接失败: {}", e);
        }
    }

    async fn publish_envelope(
        &self,
        node_id: &str,
        envelope: &DispatchEnvelope,
    ) -> OrchestratorResult<()> {
        let payload = envelope
            .serialize_bytes()
            .map_err(|e| OrchestratorError::Serialization(format!("序列化指令信封失败: {e}")))?;

        self.client
            .publish(
                self.topics.command(node_id),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| {
                OrchestratorError::TransportUnreachable(format!(
                    "发布指令到节点 {node_id} 失败: {e}"
                ))
            })
    }
}

#[async_trait]
impl DispatchTransport for MqttDispatchTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn dispatch(&self, node: &Node, order: &WorkOrder) -> OrchestratorResult<DispatchAck> {
        let mut order = order.clone();
        // 结果回传主题默认指向节点专属result主题
        if order.result.callback_topic.is_none() {
            order.result.callback_topic = Some(self.topics.result(&node.id));
        }
        let envelope = DispatchEnvelope::start_task(order.clone(), &self.topics.replies());
        let correlation_id = envelope.correlation_id.clone();

        debug!(
            "向节点 {} 下发子任务 {}/{}，关联ID: {}",
            node.id, order.task_id, order.subtask_id, correlation_id
        );

        self.publish_envelope(&node.id, &envelope).await?;

        let reply = self
            .correlations
            .wait(&correlation_id, self.reply_timeout)
            .await?;

        if reply.is_success() {
            let node_task_id = reply
                .data
                .get("task_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Ok(DispatchAck { node_task_id })
        } else {
            Err(OrchestratorError::TransportRejected(reply.error_message()))
        }
    }

    async fn stop(&self, node: &Node, task_id: i64, subtask_id: i64) -> OrchestratorResult<()> {
        // 尽力而为：发布即返回，不等待应答
        let envelope = DispatchEnvelope::stop_task(task_id, subtask_id, &self.topics.replies());
        self.publish_envelope(&node.id, &envelope).await
    }
}
