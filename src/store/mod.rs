//! Persistence layer: the durable work-item table and its state machine.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Claim, CompletedResult, Database, InsertOutcome, ListQuery, NewWorkItem, QueueStats,
    ReplyStatus, WorkItem, WorkOutcome, WorkStatus,
};
