use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderLine};
use serde::{Deserialize, Serialize};

/// An order to be written, keyed by its workflow's correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub correlation_id: CorrelationId,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
}

/// An order row in the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOrder {
    pub order_id: i64,
    pub correlation_id: CorrelationId,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
}
