//! Persistence layer: connection pooling, migrations, and query functions
//! for the `agents` and `build_queue` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use models::{Agent, AgentStatus, QueueItem, QueueStatus, SystemInfo};
