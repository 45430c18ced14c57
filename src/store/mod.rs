//! Persistence layer: SQLite-backed task and stats storage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{StatsSink, TaskStats, TaskStore};
