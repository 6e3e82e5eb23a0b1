//! Authoritative order store for the order workflow.
//!
//! This crate provides:
//! - [`OrderRequest`] and its synchronous validation rules
//! - [`OrderRepository`], one data-access interface for the order aggregate,
//!   with in-memory and PostgreSQL implementations
//! - [`IdempotentOrderWriter`], the lookup-then-insert-or-fetch write used by
//!   the process stage, keyed by the unique correlation id

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod repository;
pub mod request;
pub mod writer;

pub use common::{CorrelationId, OrderLine};
pub use error::{OrderError, RepositoryError, Result};
pub use memory::InMemoryOrderRepository;
pub use model::{NewOrder, PersistedOrder};
pub use postgres::PostgresOrderRepository;
pub use repository::OrderRepository;
pub use request::OrderRequest;
pub use writer::{IdempotentOrderWriter, WriteOutcome};
