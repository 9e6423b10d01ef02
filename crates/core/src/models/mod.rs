pub mod message;
pub mod node;
pub mod subtask;
pub mod task;
pub mod work_order;

pub use message::{
    CommandPayload, CommandReply, ConnectionAnnouncement, DispatchEnvelope, LifecycleStatus,
    NodeEvent, ReplyStatus, ResultStatus, TaskResultEvent,
};
pub use node::{Node, NodeHeartbeat, NodeRegistration, NodeStatus, TransportKind};
pub use subtask::{RetryPolicy, SourceKind, SubTask, SubTaskStatus};
pub use task::{SubTaskCounts, Task, TaskStatus};
pub use work_order::{AnalyzeConfig, ResultConfig, SourceSpec, WorkOrder};
