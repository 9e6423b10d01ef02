use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::models::subtask::SourceKind;

/// 一次分发携带的完整工单，HTTP与MQTT两种传输共用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub task_id: i64,
    pub subtask_id: i64,
    pub task_name: String,
    pub source: SourceSpec,
    pub model_code: String,
    #[serde(default)]
    pub config: AnalyzeConfig,
    #[serde(default)]
    pub result: ResultConfig,
}

/// 分析源描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub url: String,
}

/// 分析参数。封闭结构：未知字段直接导致反序列化失败，
/// 不允许在层间传递任意字典
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeConfig {
    /// 置信度阈值，默认0.25
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f64,
    /// 抽帧分析间隔（秒），默认1
    #[serde(default = "default_interval")]
    pub analysis_interval_seconds: u32,
    /// 单帧最大检出数，默认100
    #[serde(default = "default_max_detections")]
    pub max_detections: u32,
}

fn default_confidence() -> f64 {
    0.25
}

fn default_interval() -> u32 {
    1
}

fn default_max_detections() -> u32 {
    100
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence(),
            analysis_interval_seconds: default_interval(),
            max_detections: default_max_detections(),
        }
    }
}

impl AnalyzeConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(OrchestratorError::Validation(format!(
                "confidence_threshold 必须在 [0,1] 区间: {}",
                self.confidence_threshold
            )));
        }
        if self.analysis_interval_seconds == 0 {
            return Err(OrchestratorError::Validation(
                "analysis_interval_seconds 不能为0".to_string(),
            ));
        }
        if self.max_detections == 0 {
            return Err(OrchestratorError::Validation(
                "max_detections 不能为0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 结果回传配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultConfig {
    #[serde(default)]
    pub save_result: bool,
    #[serde(default)]
    pub save_images: bool,
    /// MQTT节点回传结果的主题
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_topic: Option<String>,
    /// HTTP节点回传结果的URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}
