//! Real-time push channel.
//!
//! A session may hold any number of live connections, on this instance or on
//! others. [`ConnectionHub`] tracks the local ones; a [`Backplane`] carries
//! notifications between instances, and [`run_relay`] delivers what arrives
//! on it to the local hub. Pushes are fire-and-forget: nothing is queued for
//! a session with no live connection.

mod backplane;
mod hub;
mod postgres;

use async_trait::async_trait;
use common::{CorrelationId, SessionId};
use serde::{Deserialize, Serialize};
use state_store::{WorkflowState, WorkflowStatus};
use thiserror::Error;

pub use backplane::{Backplane, BackplaneMessage, BackplanePushChannel, BroadcastBackplane, run_relay};
pub use hub::{ConnectionHub, LocalDelivery};
pub use postgres::PostgresBackplane;

/// Status update sent to every live connection of a session.
///
/// Wire shape: `{correlationId, status, orderId}` with `orderId` null until
/// the order is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotification {
    pub correlation_id: CorrelationId,
    pub status: WorkflowStatus,
    pub order_id: Option<i64>,
}

impl StatusNotification {
    pub fn from_state(correlation_id: CorrelationId, state: WorkflowState) -> Self {
        Self {
            correlation_id,
            status: state.status(),
            order_id: state.order_id(),
        }
    }

    pub fn completed(correlation_id: CorrelationId, order_id: i64) -> Self {
        Self::from_state(correlation_id, WorkflowState::completed(order_id))
    }
}

/// Errors raised by a push channel.
#[derive(Debug, Error)]
pub enum PushError {
    /// The cross-instance backplane could not be reached.
    #[error("Backplane unavailable: {0}")]
    Backplane(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Delivers notifications to all live connections of a session.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Pushes to every connection registered under `session`, wherever it is
    /// hosted. A failing connection never blocks delivery to the others.
    async fn push_to_session(
        &self,
        session: &SessionId,
        notification: &StatusNotification,
    ) -> Result<(), PushError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_wire_shape() {
        let id = CorrelationId::new();

        let completed = serde_json::to_value(StatusNotification::completed(id, 42)).unwrap();
        assert_eq!(
            completed,
            serde_json::json!({
                "correlationId": id.to_string(),
                "status": "Completed",
                "orderId": 42
            })
        );

        let accepted =
            serde_json::to_value(StatusNotification::from_state(id, WorkflowState::accepted()))
                .unwrap();
        assert_eq!(accepted["status"], "Accepted");
        assert!(accepted["orderId"].is_null());
    }
}
