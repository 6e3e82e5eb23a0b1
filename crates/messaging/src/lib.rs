//! Durable message channel between the order workflow stages.
//!
//! This crate provides:
//! - [`OrderAcceptedEvent`] and [`OrderProcessedEvent`], the two event types
//!   carried between stages
//! - [`Envelope`], which carries the correlation id both as a header and as a
//!   baggage entry
//! - [`MessageChannel`], an at-least-once leased queue, with in-memory and
//!   PostgreSQL implementations
//! - [`Consumer`], a long-running consumer loop with capped concurrency,
//!   exponential redelivery, dead-lettering and drain-on-shutdown

pub mod channel;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;

pub use channel::{DeadLetter, MessageChannel, MessageChannelExt};
pub use consumer::{Consumer, ConsumerConfig, HandlerError, MessageHandler, Outcome, RetryPolicy};
pub use envelope::{Delivery, Envelope, Receipt};
pub use error::{MessagingError, Result};
pub use event::{Message, OrderAcceptedEvent, OrderProcessedEvent};
pub use memory::InMemoryChannel;
pub use postgres::PostgresChannel;
