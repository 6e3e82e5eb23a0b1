use async_trait::async_trait;
use common::CorrelationId;

use crate::{NewOrder, PersistedOrder, Result};

/// Data access for the order aggregate.
///
/// `correlation_id` is unique across orders. All implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Looks up the order written for a workflow, if any.
    async fn find_by_correlation(&self, id: CorrelationId) -> Result<Option<PersistedOrder>>;

    /// Inserts the order and its items in one transaction, or returns the
    /// existing order when the correlation id is already taken.
    ///
    /// The boolean is true when this call created the row.
    async fn insert_or_fetch(&self, order: NewOrder) -> Result<(PersistedOrder, bool)>;
}
