//! Platform connections.

pub mod telegram;

pub use telegram::{EventStream, InboundEvent, TelegramChannel};
