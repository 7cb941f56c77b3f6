//! Messenger abstractions (Telegram today) plus the inbound update model.

pub mod port;
pub mod throttled;
pub mod types;
