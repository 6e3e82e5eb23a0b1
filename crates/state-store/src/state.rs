//! Workflow status state machine and its composite store encoding.

use common::CorrelationId;
use serde::{Deserialize, Serialize};

use crate::error::StateStoreError;

const STATUS_KEY_PREFIX: &str = "order:status:";
const MAPPING_KEY_PREFIX: &str = "order:user:";

/// Returns the state-store key for a correlation id (`order:status:<id>`).
pub fn status_key(id: CorrelationId) -> String {
    format!("{STATUS_KEY_PREFIX}{id}")
}

/// Returns the correlation-registry key for a correlation id (`order:user:<id>`).
pub fn mapping_key(id: CorrelationId) -> String {
    format!("{MAPPING_KEY_PREFIX}{id}")
}

/// The status of an order workflow as seen through the transient store.
///
/// State transitions:
/// ```text
/// Accepted ──► Processing ──► Completed
/// ```
/// There is no transition back. Ordering of the variants follows the
/// lifecycle, so `a < b` means `b` is further along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Order accepted, not yet picked up by the process stage.
    Accepted,

    /// The process stage is persisting the order.
    Processing,

    /// The order is persisted and has an order id (terminal state).
    Completed,
}

impl WorkflowStatus {
    /// Returns true if moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(&self, next: WorkflowStatus) -> bool {
        next > *self
    }

    /// Returns true if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed)
    }

    /// Monotonic rank used by backends for compare-and-advance.
    pub fn rank(&self) -> i16 {
        match self {
            WorkflowStatus::Accepted => 1,
            WorkflowStatus::Processing => 2,
            WorkflowStatus::Completed => 3,
        }
    }

    /// Returns the status name as used on the push wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Accepted => "Accepted",
            WorkflowStatus::Processing => "Processing",
            WorkflowStatus::Completed => "Completed",
        }
    }

    fn storage_tag(&self) -> &'static str {
        match self {
            WorkflowStatus::Accepted => "ACCEPTED",
            WorkflowStatus::Processing => "PROCESSING",
            WorkflowStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current workflow state for one correlation id.
///
/// The order id is present exactly when the status is `Completed`; the
/// constructors are the only way to build a value, so the pairing holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowState {
    status: WorkflowStatus,
    order_id: Option<i64>,
}

impl WorkflowState {
    pub fn accepted() -> Self {
        Self {
            status: WorkflowStatus::Accepted,
            order_id: None,
        }
    }

    pub fn processing() -> Self {
        Self {
            status: WorkflowStatus::Processing,
            order_id: None,
        }
    }

    pub fn completed(order_id: i64) -> Self {
        Self {
            status: WorkflowStatus::Completed,
            order_id: Some(order_id),
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn order_id(&self) -> Option<i64> {
        self.order_id
    }

    /// Encodes the state as a store value: `ACCEPTED`, `PROCESSING` or
    /// `COMPLETED|<orderId>`.
    pub fn encode(&self) -> String {
        match self.order_id {
            Some(order_id) => format!("{}|{order_id}", self.status.storage_tag()),
            None => self.status.storage_tag().to_string(),
        }
    }

    /// Parses a stored value by its status prefix.
    ///
    /// Only the tag before the first `|` and, for `COMPLETED`, the order id
    /// after it are read. Further `|`-separated fields are ignored so values
    /// written by newer versions still decode. `key` is only used to build
    /// the error.
    pub fn decode(key: &str, value: &str) -> Result<Self, StateStoreError> {
        let corrupt = || StateStoreError::CorruptValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        let mut fields = value.split('|');
        match fields.next() {
            Some("ACCEPTED") => Ok(Self::accepted()),
            Some("PROCESSING") => Ok(Self::processing()),
            Some("COMPLETED") => fields
                .next()
                .and_then(|id| id.parse::<i64>().ok())
                .map(Self::completed)
                .ok_or_else(corrupt),
            _ => Err(corrupt()),
        }
    }

    /// Like [`decode`](Self::decode), but an unreadable value is logged and
    /// read as absent. The store is not authoritative, so callers carry on as
    /// if the key had expired.
    pub fn decode_lenient(key: &str, value: &str) -> Option<Self> {
        match Self::decode(key, value) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable workflow state");
                None
            }
        }
    }
}
