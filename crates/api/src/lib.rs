//! orchestrator-api
//!
//! 任务与节点管理的REST接口，薄封装在TaskController/NodeRegistry之上。

pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;

pub use routes::{create_router, AppState};
