//! Notify stage: pushes completion to the session that placed the order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use messaging::{HandlerError, MessageHandler, OrderProcessedEvent};
use state_store::CorrelationRegistry;

use crate::error::{Dependency, Result, WorkflowError, bounded};
use crate::push::{PushChannel, StatusNotification};

/// Consumes `order.processed` and pushes a `Completed` notification.
pub struct NotifyStage {
    registry: Arc<dyn CorrelationRegistry>,
    push: Arc<dyn PushChannel>,
    timeout: Duration,
}

impl NotifyStage {
    pub fn new(
        registry: Arc<dyn CorrelationRegistry>,
        push: Arc<dyn PushChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            push,
            timeout,
        }
    }

    /// Resolves the owning session and pushes to all of its connections.
    ///
    /// A missing mapping is retryable: it may not be visible yet. The
    /// consumer's retry bound decides when to give up.
    #[tracing::instrument(skip_all, fields(correlation_id = %event.correlation_id, order_id = event.order_id))]
    pub async fn notify(&self, event: OrderProcessedEvent) -> Result<()> {
        let session = bounded(
            Dependency::CorrelationRegistry,
            self.timeout,
            self.registry.resolve(event.correlation_id),
        )
        .await?;

        let Some(session) = session else {
            metrics::counter!("mapping_not_found_total").increment(1);
            tracing::warn!("no session mapping for correlation id");
            return Err(WorkflowError::MappingNotFound(event.correlation_id));
        };

        let notification = StatusNotification::completed(event.correlation_id, event.order_id);
        bounded(
            Dependency::PushBackplane,
            self.timeout,
            self.push.push_to_session(&session, &notification),
        )
        .await?;

        tracing::info!(%session, "completion pushed");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for NotifyStage {
    type Message = OrderProcessedEvent;

    async fn handle(&self, message: OrderProcessedEvent) -> std::result::Result<(), HandlerError> {
        self.notify(message).await.map_err(HandlerError::from)
    }
}

#[cfg(test)]
mod tests {
    use common::{CorrelationId, SessionId};
    use state_store::{InMemoryTransientStore, TtlConfig};
    use tokio::sync::mpsc;

    use super::*;
    use crate::push::ConnectionHub;

    fn stage(store: &InMemoryTransientStore, hub: &ConnectionHub) -> NotifyStage {
        NotifyStage::new(
            Arc::new(store.clone()),
            Arc::new(hub.clone()),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn pushes_completed_to_all_session_connections() {
        let store = InMemoryTransientStore::default();
        let hub = ConnectionHub::new();
        let session = SessionId::new("session-1");
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(session.clone(), tx_a).await;
        hub.register(session.clone(), tx_b).await;

        let id = CorrelationId::new();
        store.register(id, &session).await.unwrap();

        stage(&store, &hub)
            .notify(OrderProcessedEvent {
                correlation_id: id,
                order_id: 42,
            })
            .await
            .unwrap();

        let expected = StatusNotification::completed(id, 42);
        assert_eq!(rx_a.recv().await, Some(expected));
        assert_eq!(rx_b.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn missing_mapping_is_retryable() {
        let store = InMemoryTransientStore::default();
        let hub = ConnectionHub::new();
        let id = CorrelationId::new();

        let err = stage(&store, &hub)
            .notify(OrderProcessedEvent {
                correlation_id: id,
                order_id: 99,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::MappingNotFound(c) if c == id));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_mapping_is_retryable() {
        let store = InMemoryTransientStore::new(TtlConfig {
            state_ttl: Duration::from_secs(60),
            mapping_ttl: Duration::from_secs(1),
        });
        let hub = ConnectionHub::new();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("s")).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let err = stage(&store, &hub)
            .handle(OrderProcessedEvent {
                correlation_id: id,
                order_id: 99,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Retryable(_)));
    }

    #[tokio::test]
    async fn duplicate_events_push_duplicate_notifications() {
        let store = InMemoryTransientStore::default();
        let hub = ConnectionHub::new();
        let session = SessionId::new("s");
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(session.clone(), tx).await;
        let id = CorrelationId::new();
        store.register(id, &session).await.unwrap();

        let stage = stage(&store, &hub);
        let event = OrderProcessedEvent {
            correlation_id: id,
            order_id: 5,
        };
        stage.notify(event).await.unwrap();
        stage.notify(event).await.unwrap();

        let expected = StatusNotification::completed(id, 5);
        assert_eq!(rx.recv().await, Some(expected));
        assert_eq!(rx.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn session_without_connections_is_not_an_error() {
        let store = InMemoryTransientStore::default();
        let hub = ConnectionHub::new();
        let id = CorrelationId::new();
        store.register(id, &SessionId::new("offline")).await.unwrap();

        assert!(
            stage(&store, &hub)
                .notify(OrderProcessedEvent {
                    correlation_id: id,
                    order_id: 1,
                })
                .await
                .is_ok()
        );
    }
}
