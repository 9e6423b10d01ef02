pub mod repository;
pub mod transport;

pub use repository::{NodeRepository, SubTaskRepository, TaskRepository};
pub use transport::{DispatchAck, DispatchTransport};
