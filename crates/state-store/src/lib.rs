//! Transient workflow visibility for the order workflow.
//!
//! Two independently keyed, TTL-bound stores live here:
//! - [`WorkflowStateStore`]: correlation id -> current [`WorkflowState`]
//! - [`CorrelationRegistry`]: correlation id -> submitting [`SessionId`](common::SessionId)
//!
//! Neither is a system of record. Expiry is loss of visibility, not an error.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod state;
pub mod store;

pub use common::CorrelationId;
pub use error::{Result, StateStoreError};
pub use memory::InMemoryTransientStore;
pub use postgres::PostgresTransientStore;
pub use state::{WorkflowState, WorkflowStatus, mapping_key, status_key};
pub use store::{Advance, CorrelationRegistry, TtlConfig, WorkflowStateStore};
