//! orchestrator-infrastructure
//!
//! 仓储的SQLite实现，以及HTTP/MQTT两种分发传输通道。

pub mod database;
pub mod transport;

pub use database::{
    connect, initialize_schema, SqliteNodeRepository, SqliteSubTaskRepository,
    SqliteTaskRepository,
};
pub use transport::{CorrelationMap, HttpDispatchTransport, MqttDispatchTransport, TopicScheme};
