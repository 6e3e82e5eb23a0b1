use std::time::Duration;

use async_trait::async_trait;
use common::{CorrelationId, SessionId};

use crate::{Result, WorkflowState};

/// Time-to-live settings for the two transient keyspaces.
///
/// The workflow state and the session mapping expire independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlConfig {
    pub state_ttl: Duration,
    pub mapping_ttl: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(3600),
            mapping_ttl: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a compare-and-advance on the workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The new state was written.
    Applied,

    /// The stored state was already at or beyond the requested one and was
    /// left untouched.
    Unchanged { current: WorkflowState },
}

impl Advance {
    pub fn is_applied(&self) -> bool {
        matches!(self, Advance::Applied)
    }
}

/// Transient store of the current workflow state per correlation id.
///
/// All operations are atomic per key. Implementations must be thread-safe.
#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Reads the current state. Returns `None` when the key is absent or expired.
    async fn get_state(&self, id: CorrelationId) -> Result<Option<WorkflowState>>;

    /// Writes `state` only if it is strictly further along than the stored
    /// state (or nothing is stored), refreshing the TTL on write.
    ///
    /// This keeps the status monotonic and makes redelivered writes no-ops.
    async fn advance(&self, id: CorrelationId, state: WorkflowState) -> Result<Advance>;
}

/// Transient mapping from correlation id to the submitting client session.
#[async_trait]
pub trait CorrelationRegistry: Send + Sync {
    /// Records which session submitted the order, with the mapping TTL.
    async fn register(&self, id: CorrelationId, session: &SessionId) -> Result<()>;

    /// Resolves the owning session. `None` when absent or expired.
    async fn resolve(&self, id: CorrelationId) -> Result<Option<SessionId>>;
}
