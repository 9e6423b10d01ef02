use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::models::work_order::AnalyzeConfig;

/// 最小可调度单元：一个 (源 × 模型) 组合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: i64,
    pub task_id: i64,
    pub source_kind: SourceKind,
    pub source_url: String,
    pub model_code: String,
    /// 分析参数，创建时定型，随工单下发
    pub config: AnalyzeConfig,
    /// 当前承载节点，RUNNING状态下必为Some
    pub node_id: Option<String>,
    pub status: SubTaskStatus,
    pub retry_count: i32,
    /// 退避闸门：重试前不早于该时刻重新进入调度
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 数值越大越优先，仅作为排序提示
    pub priority: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubTaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "failed")]
    Failed,
}

/// 分析源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceKind {
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "stream")]
    Stream,
}

impl sqlx::Type<sqlx::Sqlite> for SubTaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SubTaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "pending" => Ok(SubTaskStatus::Pending),
            "running" => Ok(SubTaskStatus::Running),
            "completed" => Ok(SubTaskStatus::Completed),
            "stopped" => Ok(SubTaskStatus::Stopped),
            "failed" => Ok(SubTaskStatus::Failed),
            _ => Err(format!("Invalid subtask status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SubTaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Running => "running",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Stopped => "stopped",
            SubTaskStatus::Failed => "failed",
        };
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(s, buf)
    }
}

impl sqlx::Type<sqlx::Sqlite> for SourceKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SourceKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "image" => Ok(SourceKind::Image),
            "video" => Ok(SourceKind::Video),
            "stream" => Ok(SourceKind::Stream),
            _ => Err(format!("Invalid source kind: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SourceKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            SourceKind::Image => "image",
            SourceKind::Video => "video",
            SourceKind::Stream => "stream",
        };
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(s, buf)
    }
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Image => "image",
            SourceKind::Video => "video",
            SourceKind::Stream => "stream",
        }
    }
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Running => "running",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Stopped => "stopped",
            SubTaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubTaskStatus::Completed | SubTaskStatus::Stopped | SubTaskStatus::Failed
        )
    }

    /// 合法状态迁移表
    ///
    /// PENDING → RUNNING / STOPPED / FAILED
    /// RUNNING → COMPLETED / FAILED / STOPPED / PENDING（仅恢复路径）
    pub fn can_transition_to(&self, next: SubTaskStatus) -> bool {
        use SubTaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Running, Pending)
        )
    }
}

/// 重试退避策略：delay = base · factor^retry_count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay_seconds: u64,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 5,
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// 第retry_count次失败后的等待时长（5s → 5/10/20）
    pub fn delay_seconds(&self, retry_count: i32) -> u64 {
        let exp = retry_count.max(0) as u32;
        self.base_delay_seconds * (self.backoff_factor as u64).pow(exp)
    }

    pub fn next_retry_at(&self, retry_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(self.delay_seconds(retry_count) as i64)
    }

    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

impl SubTask {
    pub fn new(task_id: i64, source_kind: SourceKind, source_url: String, model_code: String) -> Self {
        Self {
            id: 0, // 由数据库生成
            task_id,
            source_kind,
            source_url,
            model_code,
            config: AnalyzeConfig::default(),
            node_id: None,
            status: SubTaskStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            priority: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn ensure_transition(&self, next: SubTaskStatus) -> OrchestratorResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    /// 分发成功：PENDING → RUNNING，必须绑定节点
    pub fn mark_dispatched(&mut self, node_id: &str) -> OrchestratorResult<()> {
        self.ensure_transition(SubTaskStatus::Running)?;
        self.status = SubTaskStatus::Running;
        self.node_id = Some(node_id.to_string());
        self.started_at = Some(Utc::now());
        self.next_retry_at = None;
        self.error_message = None;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> OrchestratorResult<()> {
        self.ensure_transition(SubTaskStatus::Completed)?;
        self.status = SubTaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// 失败：按策略决定重新排队或终态失败
    ///
    /// 返回true表示已重新进入PENDING等待退避后重试
    pub fn mark_failed(&mut self, reason: &str, policy: &RetryPolicy) -> OrchestratorResult<bool> {
        self.ensure_transition(SubTaskStatus::Failed)?;
        self.retry_count += 1;
        self.node_id = None;
        self.started_at = None;
        if policy.is_exhausted(self.retry_count) {
            self.status = SubTaskStatus::Failed;
            self.completed_at = Some(Utc::now());
            self.error_message = Some(reason.to_string());
            self.next_retry_at = None;
            Ok(false)
        } else {
            self.status = SubTaskStatus::Pending;
            self.error_message = Some(reason.to_string());
            // 第n次失败等待 base·2^(n-1)：5s → 5/10/20
            self.next_retry_at = Some(policy.next_retry_at(self.retry_count - 1, Utc::now()));
            Ok(true)
        }
    }

    pub fn mark_stopped(&mut self) -> OrchestratorResult<()> {
        self.ensure_transition(SubTaskStatus::Stopped)?;
        self.status = SubTaskStatus::Stopped;
        self.node_id = None;
        self.completed_at = Some(Utc::now());
        self.next_retry_at = None;
        Ok(())
    }

    /// 恢复路径：RUNNING → PENDING，清除节点与开始时间，不消耗重试预算
    pub fn reset_for_recovery(&mut self, reason: &str) -> OrchestratorResult<()> {
        self.ensure_transition(SubTaskStatus::Pending)?;
        self.status = SubTaskStatus::Pending;
        self.node_id = None;
        self.started_at = None;
        self.next_retry_at = None;
        self.error_message = Some(reason.to_string());
        Ok(())
    }

    /// 是否已到达可调度时刻（退避闸门）
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubTaskStatus::Pending
            && self.next_retry_at.map(|at| at <= now).unwrap_or(true)
    }
}
