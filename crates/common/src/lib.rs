//! Shared identifiers and wire value types used across the order workflow crates.

pub mod types;

pub use types::{ConnectionId, CorrelationId, OrderLine, SessionId};
