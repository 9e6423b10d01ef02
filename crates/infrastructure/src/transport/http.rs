use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use orchestrator_core::config::HttpDispatchConfig;
use orchestrator_core::models::{Node, TransportKind, WorkOrder};
use orchestrator_core::traits::{DispatchAck, DispatchTransport};
use orchestrator_core::{OrchestratorError, OrchestratorResult};

/// HTTP分发传输：同步请求/响应，有界超时
pub struct HttpDispatchTransport {
    client: reqwest::Client,
}

/// 节点analyze接口的响应
#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    success: bool,
    #[serde(default)]
    data: Option<AnalyzeResponseData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponseData {
    task_id: String,
}

impl HttpDispatchTransport {
    pub fn new(config: &HttpDispatchConfig) -> OrchestratorResult<Self> {
        // 经代理转发的调用链更长，放宽超时
        let timeout_seconds = if config.use_proxy {
            config.proxy_timeout_seconds
        } else {
            config.request_timeout_seconds
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("构建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }

    fn analyze_url(node: &Node) -> String {
        format!("{}/api/v1/analyze", node.base_url())
    }

    fn stop_url(node: &Node, subtask_id: i64) -> String {
        format!("{}/api/v1/tasks/{}/stop", node.base_url(), subtask_id)
    }

    /// 组装analyze请求体
    fn build_request_body(order: &WorkOrder) -> serde_json::Value {
        json!({
            "model_code": order.model_code,
            "task_name": order.task_name,
            "source": {
                "type": order.source.kind.as_str(),
                "url": order.source.url,
            },
            "subtask_id": order.subtask_id,
            "save_result": order.result.save_result,
            "save_images": order.result.save_images,
            "callback_url": order.result.callback_url,
            "config": order.config,
        })
    }

    fn map_request_error(node: &Node, e: reqwest::Error) -> OrchestratorError {
        if e.is_timeout() {
            OrchestratorError::TransportTimeout(format!("请求节点 {} 超时", node.id))
        } else if e.is_connect() {
            OrchestratorError::TransportUnreachable(format!("无法连接节点 {}: {e}", node.id))
        } else {
            OrchestratorError::TransportUnreachable(format!("请求节点 {} 失败: {e}", node.id))
        }
    }
}

#[async_trait]
impl DispatchTransport for HttpDispatchTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn dispatch(&self, node: &Node, order: &WorkOrder) -> OrchestratorResult<DispatchAck> {
        let url = Self::analyze_url(node);
        let body = Self::build_request_body(order);

        debug!(
            "HTTP分发子任务 {}/{} 到节点 {} ({})",
            order.task_id, order.subtask_id, node.id, url
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_request_error(node, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::TransportRejected(format!(
                "节点 {} 返回 {status}",
                node.id
            )));
        }

        let parsed: AnalyzeResponse = response.json().await.map_err(|e| {
            OrchestratorError::Serialization(format!("解析节点 {} 响应失败: {e}", node.id))
        })?;

        // 2xx + task_id 才算受理成功
        match (parsed.success, parsed.data) {
            (true, Some(data)) => Ok(DispatchAck {
                node_task_id: Some(data.task_id),
            }),
            _ => Err(OrchestratorError::TransportRejected(
                parsed
                    .message
                    .unwrap_or_else(|| format!("节点 {} 未受理任务", node.id)),
            )),
        }
    }

    async fn stop(&self, node: &Node, _task_id: i64, subtask_id: i64) -> OrchestratorResult<()> {
        let url = Self::stop_url(node, subtask_id);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::map_request_error(node, e))?;
        Ok(())
    }
}
