//! autoforward: rule-driven message forwarding for Telegram.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod tasks;
