pub mod correlation;
pub mod http;
pub mod mqtt;

pub use correlation::CorrelationMap;
pub use http::HttpDispatchTransport;
pub use mqtt::{MessageRouter, MqttDispatchTransport, TopicScheme};
