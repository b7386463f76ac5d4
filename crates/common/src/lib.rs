//! Shared types and helpers used across all switchboard crates.

pub mod time;
pub mod types;

pub use {
    time::{duration_ms, now_ms},
    types::{InboundEvent, MessagePayload, normalize_sender},
};
