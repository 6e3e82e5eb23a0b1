//! Last-known status lookup for reconnecting clients.

use std::sync::Arc;
use std::time::Duration;

use common::CorrelationId;
use orders::OrderRepository;
use serde::{Deserialize, Serialize};
use state_store::{WorkflowStateStore, WorkflowStatus};

use crate::error::{Dependency, Result, bounded};

/// Status as reported to clients.
///
/// `Unknown` means neither the transient store nor the order store knows the
/// correlation id: it expired before completing, or never existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedStatus {
    Accepted,
    Processing,
    Completed,
    Unknown,
}

impl From<WorkflowStatus> for ReportedStatus {
    fn from(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Accepted => ReportedStatus::Accepted,
            WorkflowStatus::Processing => ReportedStatus::Processing,
            WorkflowStatus::Completed => ReportedStatus::Completed,
        }
    }
}

/// Answer to a status query, in the push notification's wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub correlation_id: CorrelationId,
    pub status: ReportedStatus,
    pub order_id: Option<i64>,
}

/// Reads the transient state, consulting the order store whenever that state
/// is missing or not yet terminal.
pub struct StatusQuery {
    states: Arc<dyn WorkflowStateStore>,
    orders: Arc<dyn OrderRepository>,
    timeout: Duration,
}

impl StatusQuery {
    pub fn new(
        states: Arc<dyn WorkflowStateStore>,
        orders: Arc<dyn OrderRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            states,
            orders,
            timeout,
        }
    }

    #[tracing::instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub async fn status(&self, correlation_id: CorrelationId) -> Result<StatusReport> {
        let state = bounded(
            Dependency::StateStore,
            self.timeout,
            self.states.get_state(correlation_id),
        )
        .await?;

        if let Some(state) = state.filter(|s| s.status().is_terminal()) {
            return Ok(StatusReport {
                correlation_id,
                status: state.status().into(),
                order_id: state.order_id(),
            });
        }

        // A persisted order outranks an in-flight transient state that has
        // not caught up yet.
        let persisted = bounded(
            Dependency::OrderStore,
            self.timeout,
            self.orders.find_by_correlation(correlation_id),
        )
        .await?;

        Ok(match (persisted, state) {
            (Some(order), _) => StatusReport {
                correlation_id,
                status: ReportedStatus::Completed,
                order_id: Some(order.order_id),
            },
            (None, Some(state)) => StatusReport {
                correlation_id,
                status: state.status().into(),
                order_id: None,
            },
            (None, None) => StatusReport {
                correlation_id,
                status: ReportedStatus::Unknown,
                order_id: None,
            },
        })
    }
}
