//! Events exchanged between the workflow stages.

use common::{CorrelationId, OrderLine};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A message type that travels on its own topic.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic (queue name) the message is published to.
    const TOPIC: &'static str;

    /// Correlation id of the workflow this message belongs to.
    fn correlation_id(&self) -> CorrelationId;
}

/// Published by the accept stage once per accepted order.
///
/// Consumed at least once by the process stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAcceptedEvent {
    pub correlation_id: CorrelationId,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
}

impl Message for OrderAcceptedEvent {
    const TOPIC: &'static str = "order.accepted";

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

/// Published by the process stage after the order is persisted.
///
/// Consumed at least once by the notify stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProcessedEvent {
    pub correlation_id: CorrelationId,
    pub order_id: i64,
}

impl Message for OrderProcessedEvent {
    const TOPIC: &'static str = "order.processed";

    fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}
