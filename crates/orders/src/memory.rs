use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::CorrelationId;
use tokio::sync::RwLock;

use crate::{NewOrder, OrderRepository, PersistedOrder, RepositoryError, Result};

#[derive(Debug, Default)]
struct OrderTable {
    by_correlation: HashMap<CorrelationId, PersistedOrder>,
    next_id: i64,
}

/// In-memory order repository for testing.
///
/// Mirrors the unique constraint on `correlation_id`: the check and the
/// insert happen under one write lock.
#[derive(Clone, Default)]
pub struct InMemoryOrderRepository {
    table: Arc<RwLock<OrderTable>>,
    unavailable: Arc<AtomicBool>,
    fail_next_inserts: Arc<AtomicUsize>,
}

impl InMemoryOrderRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `n` inserts fail with `Unavailable`.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_next_inserts.store(n, Ordering::SeqCst);
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.table.read().await.by_correlation.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "in-memory order store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn find_by_correlation(&self, id: CorrelationId) -> Result<Option<PersistedOrder>> {
        self.check_available()?;
        Ok(self.table.read().await.by_correlation.get(&id).cloned())
    }

    async fn insert_or_fetch(&self, order: NewOrder) -> Result<(PersistedOrder, bool)> {
        self.check_available()?;
        let injected = self
            .fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(RepositoryError::Unavailable(
                "injected insert failure".to_string(),
            ));
        }

        let mut table = self.table.write().await;
        if let Some(existing) = table.by_correlation.get(&order.correlation_id) {
            return Ok((existing.clone(), false));
        }

        table.next_id += 1;
        let persisted = PersistedOrder {
            order_id: table.next_id,
            correlation_id: order.correlation_id,
            customer_id: order.customer_id,
            items: order.items,
            created_at: Utc::now(),
        };
        table
            .by_correlation
            .insert(persisted.correlation_id, persisted.clone());
        Ok((persisted, true))
    }
}

#[cfg(test)]
mod tests {
    use common::OrderLine;

    use super::*;

    fn new_order(id: CorrelationId) -> NewOrder {
        NewOrder {
            correlation_id: id,
            customer_id: "CUST-001".to_string(),
            items: vec![OrderLine::new("SKU-001", 2)],
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let repo = InMemoryOrderRepository::new();
        let (a, created_a) = repo.insert_or_fetch(new_order(CorrelationId::new())).await.unwrap();
        let (b, created_b) = repo.insert_or_fetch(new_order(CorrelationId::new())).await.unwrap();

        assert!(created_a && created_b);
        assert_eq!(a.order_id, 1);
        assert_eq!(b.order_id, 2);
    }

    #[tokio::test]
    async fn duplicate_correlation_returns_existing_row() {
        let repo = InMemoryOrderRepository::new();
        let id = CorrelationId::new();

        let (first, created) = repo.insert_or_fetch(new_order(id)).await.unwrap();
        assert!(created);
        let (second, created) = repo.insert_or_fetch(new_order(id)).await.unwrap();
        assert!(!created);

        assert_eq!(first, second);
        assert_eq!(repo.order_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_create_one_row() {
        let repo = InMemoryOrderRepository::new();
        let id = CorrelationId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.insert_or_fetch(new_order(id)).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        let mut created = 0;
        for handle in handles {
            let (order, was_created) = handle.await.unwrap();
            ids.push(order.order_id);
            created += usize::from(was_created);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(repo.order_count().await, 1);
    }

    #[tokio::test]
    async fn find_by_correlation_returns_written_order() {
        let repo = InMemoryOrderRepository::new();
        let id = CorrelationId::new();
        let (order, _) = repo.insert_or_fetch(new_order(id)).await.unwrap();

        assert_eq!(repo.find_by_correlation(id).await.unwrap(), Some(order));
        assert!(repo.find_by_correlation(CorrelationId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_bounded() {
        let repo = InMemoryOrderRepository::new();
        repo.fail_next_inserts(1);

        let err = repo
            .insert_or_fetch(new_order(CorrelationId::new()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(repo.insert_or_fetch(new_order(CorrelationId::new())).await.is_ok());
    }
}
