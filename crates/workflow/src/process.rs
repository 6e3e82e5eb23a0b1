//! Process stage: persists accepted orders exactly once per correlation id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use messaging::{
    HandlerError, MessageChannel, MessageChannelExt, MessageHandler, OrderAcceptedEvent,
    OrderProcessedEvent,
};
use orders::{IdempotentOrderWriter, NewOrder, OrderRepository};
use state_store::{Advance, WorkflowState, WorkflowStateStore};

use crate::error::{Dependency, Result, bounded};

/// Consumes `order.accepted`, writes the order and publishes `order.processed`.
///
/// Safe to run any number of times for the same event: state writes only move
/// forward, and the writer returns the existing order on redelivery.
pub struct ProcessStage {
    states: Arc<dyn WorkflowStateStore>,
    writer: IdempotentOrderWriter<dyn OrderRepository>,
    channel: Arc<dyn MessageChannel>,
    timeout: Duration,
}

impl ProcessStage {
    pub fn new(
        states: Arc<dyn WorkflowStateStore>,
        orders: Arc<dyn OrderRepository>,
        channel: Arc<dyn MessageChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            states,
            writer: IdempotentOrderWriter::new(orders),
            channel,
            timeout,
        }
    }

    /// Handles one delivery of an accepted order.
    ///
    /// Any error leaves the message for redelivery; a later attempt resumes
    /// from whatever was already written.
    #[tracing::instrument(skip_all, fields(correlation_id = %event.correlation_id))]
    pub async fn process(&self, event: OrderAcceptedEvent) -> Result<OrderProcessedEvent> {
        let correlation_id = event.correlation_id;

        let started = bounded(
            Dependency::StateStore,
            self.timeout,
            self.states.advance(correlation_id, WorkflowState::processing()),
        )
        .await?;
        if let Advance::Unchanged { current } = started {
            tracing::debug!(status = %current.status(), "state already past processing");
        }

        let written = bounded(
            Dependency::OrderStore,
            self.timeout,
            self.writer.write(NewOrder {
                correlation_id,
                customer_id: event.customer_id,
                items: event.items,
            }),
        )
        .await?;
        let order_id = written.order.order_id;

        let completed = bounded(
            Dependency::StateStore,
            self.timeout,
            self.states
                .advance(correlation_id, WorkflowState::completed(order_id)),
        )
        .await?;
        if let Advance::Unchanged { current } = completed {
            if current.order_id() != Some(order_id) {
                tracing::warn!(
                    order_id,
                    recorded = ?current.order_id(),
                    "transient state records a different order id"
                );
            }
        }

        let processed = OrderProcessedEvent {
            correlation_id,
            order_id,
        };
        bounded(
            Dependency::MessageChannel,
            self.timeout,
            self.channel.publish_message(&processed),
        )
        .await?;

        tracing::info!(order_id, created = written.created, "order processed");
        Ok(processed)
    }
}

#[async_trait]
impl MessageHandler for ProcessStage {
    type Message = OrderAcceptedEvent;

    async fn handle(&self, message: OrderAcceptedEvent) -> std::result::Result<(), HandlerError> {
        self.process(message).await.map(|_| ()).map_err(HandlerError::from)
    }
}
