pub mod config;
pub mod models;
pub mod queries;
pub mod store;

pub use config::{BrokerConfig, OrchestratorConfig};
pub use models::{Consumer, Task, TaskStatus};
pub use store::{ConsumerStore, TaskStore};
