use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户级分析任务，由若干 (源 × 模型) 子任务组成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    /// 派生状态：由子任务聚合计算，用户主动停止除外
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub active_subtasks: i32,
    pub total_subtasks: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "failed")]
    Failed,
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "stopped" => Ok(TaskStatus::Stopped),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Failed => "failed",
        };
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode(s, buf)
    }
}

/// 子任务状态计数快照，用于派生主任务状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubTaskCounts {
    pub pending: i32,
    pub running: i32,
    pub completed: i32,
    pub stopped: i32,
    pub failed: i32,
}

impl SubTaskCounts {
    pub fn total(&self) -> i32 {
        self.pending + self.running + self.completed + self.stopped + self.failed
    }
}

impl TaskStatus {
    /// 由子任务计数派生主任务状态
    ///
    /// 规则：有运行中子任务即为running；全部pending为pending；
    /// 全部终态失败为failed；其余情况为stopped，错误信息区分
    /// 用户停止/全部失败/部分完成。
    pub fn derive(counts: &SubTaskCounts) -> (TaskStatus, Option<String>) {
        let total = counts.total();
        if total == 0 {
            return (TaskStatus::Pending, None);
        }
        if counts.running > 0 {
            return (TaskStatus::Running, None);
        }
        if counts.pending == total {
            return (TaskStatus::Pending, None);
        }
        if counts.failed == total {
            return (TaskStatus::Failed, Some("所有子任务均已失败".to_string()));
        }
        // 没有运行中的子任务且并非全部待执行：任务处于停止态
        let message = if counts.stopped > 0 && counts.failed == 0 && counts.pending == 0 {
            if counts.completed > 0 {
                format!("{}个子任务完成，{}个被停止", counts.completed, counts.stopped)
            } else {
                "任务已被用户停止".to_string()
            }
        } else if counts.failed > 0 {
            format!(
                "部分子任务失败: 完成{}个，失败{}个，停止{}个，待执行{}个",
                counts.completed, counts.failed, counts.stopped, counts.pending
            )
        } else {
            format!("{}个子任务完成，{}个待执行", counts.completed, counts.pending)
        };
        (TaskStatus::Stopped, Some(message))
    }
}

impl Task {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由数据库生成
            name,
            status: TaskStatus::Pending,
            error_message: None,
            active_subtasks: 0,
            total_subtasks: 0,
            created_at: now,
            started_at: None,
            stopped_at: None,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Stopped | TaskStatus::Failed)
    }
}
