use std::sync::Arc;

use metrics::counter;
use tracing::instrument;

use crate::{NewOrder, OrderRepository, PersistedOrder, Result};

/// Result of an idempotent write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub order: PersistedOrder,

    /// False when an earlier delivery already wrote this order.
    pub created: bool,
}

/// Writes at most one order per correlation id, however often it is called.
///
/// A cheap lookup short-circuits the common redelivery case; the repository's
/// insert-or-fetch closes the race between concurrent first writers.
pub struct IdempotentOrderWriter<R: ?Sized> {
    repo: Arc<R>,
}

impl<R: ?Sized> Clone for IdempotentOrderWriter<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: OrderRepository + ?Sized> IdempotentOrderWriter<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    #[instrument(skip(self, order), fields(correlation_id = %order.correlation_id))]
    pub async fn write(&self, order: NewOrder) -> Result<WriteOutcome> {
        if let Some(existing) = self.repo.find_by_correlation(order.correlation_id).await? {
            tracing::debug!(order_id = existing.order_id, "Order already persisted");
            counter!("orders_persisted_total", "outcome" => "deduplicated").increment(1);
            return Ok(WriteOutcome {
                order: existing,
                created: false,
            });
        }

        let (order, created) = self.repo.insert_or_fetch(order).await?;
        let outcome = if created { "created" } else { "deduplicated" };
        counter!("orders_persisted_total", "outcome" => outcome).increment(1);
        tracing::info!(order_id = order.order_id, outcome, "Order persisted");

        Ok(WriteOutcome { order, created })
    }
}
