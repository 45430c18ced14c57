//! Forwarding tasks: the typed model and the admin commands that manage it.

pub mod commands;
pub mod model;
pub mod seed;

pub use commands::{Command, CommandHandler, CommandParser};
pub use model::{Task, TaskRecord, TaskStatus};
