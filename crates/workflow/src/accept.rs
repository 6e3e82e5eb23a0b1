//! Accept stage: the synchronous entry point of the workflow.

use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationId, SessionId};
use messaging::{MessageChannel, MessageChannelExt, OrderAcceptedEvent};
use orders::OrderRequest;
use state_store::{CorrelationRegistry, WorkflowState, WorkflowStateStore};

use crate::error::{Dependency, Result, bounded};

/// Accepts validated order requests and hands them to the process stage.
pub struct AcceptStage {
    registry: Arc<dyn CorrelationRegistry>,
    states: Arc<dyn WorkflowStateStore>,
    channel: Arc<dyn MessageChannel>,
    timeout: Duration,
}

impl AcceptStage {
    pub fn new(
        registry: Arc<dyn CorrelationRegistry>,
        states: Arc<dyn WorkflowStateStore>,
        channel: Arc<dyn MessageChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            states,
            channel,
            timeout,
        }
    }

    /// Accepts an order for `session` and returns its correlation id without
    /// waiting for the later stages.
    ///
    /// The mapping and the initial state are written before the event is
    /// published, so a failure anywhere leaves no published event behind.
    /// Keys written before a failure simply expire.
    #[tracing::instrument(skip_all, fields(session = %session, correlation_id))]
    pub async fn accept(&self, request: OrderRequest, session: &SessionId) -> Result<CorrelationId> {
        request.validate()?;

        let correlation_id = CorrelationId::new();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        bounded(
            Dependency::CorrelationRegistry,
            self.timeout,
            self.registry.register(correlation_id, session),
        )
        .await?;

        bounded(
            Dependency::StateStore,
            self.timeout,
            self.states.advance(correlation_id, WorkflowState::accepted()),
        )
        .await?;

        let event = OrderAcceptedEvent {
            correlation_id,
            customer_id: request.customer_id,
            items: request.items,
        };
        bounded(
            Dependency::MessageChannel,
            self.timeout,
            self.channel.publish_message(&event),
        )
        .await?;

        metrics::counter!("orders_accepted_total").increment(1);
        tracing::info!(items = event.items.len(), "order accepted");
        Ok(correlation_id)
    }
}
