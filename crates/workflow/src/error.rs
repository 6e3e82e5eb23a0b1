//! Workflow error taxonomy.

use std::future::Future;
use std::time::Duration;

use common::CorrelationId;
use messaging::{HandlerError, MessagingError};
use orders::{OrderError, RepositoryError};
use state_store::StateStoreError;
use thiserror::Error;

use crate::push::PushError;

/// An external collaborator a stage depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    StateStore,
    CorrelationRegistry,
    MessageChannel,
    OrderStore,
    PushBackplane,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::StateStore => "state_store",
            Dependency::CorrelationRegistry => "correlation_registry",
            Dependency::MessageChannel => "message_channel",
            Dependency::OrderStore => "order_store",
            Dependency::PushBackplane => "push_backplane",
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while driving an order through the workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The order request is malformed. Terminal; never enters the workflow.
    #[error("Invalid order: {0}")]
    Validation(#[from] OrderError),

    /// A dependency was unreachable or exceeded its time bound.
    #[error("{dependency} unavailable: {reason}")]
    Unavailable {
        dependency: Dependency,
        reason: String,
    },

    /// No session is registered for the correlation id (yet, or any more).
    #[error("No session mapping for correlation {0}")]
    MappingNotFound(CorrelationId),

    /// Stored data violates an invariant; retrying will not help.
    #[error("Integrity violation: {0}")]
    Integrity(String),
}

impl WorkflowError {
    /// Returns true if the same operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Unavailable { .. } | WorkflowError::MappingNotFound(_)
        )
    }

    fn from_dependency(dependency: Dependency, transient: bool, error: impl ToString) -> Self {
        if transient {
            WorkflowError::Unavailable {
                dependency,
                reason: error.to_string(),
            }
        } else {
            WorkflowError::Integrity(format!("{dependency}: {}", error.to_string()))
        }
    }
}

impl From<WorkflowError> for HandlerError {
    fn from(err: WorkflowError) -> Self {
        if err.is_retryable() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

/// Error types of the stores and channels a stage calls into.
pub(crate) trait CollaboratorError: std::fmt::Display {
    fn is_transient(&self) -> bool;
}

impl CollaboratorError for StateStoreError {
    fn is_transient(&self) -> bool {
        StateStoreError::is_transient(self)
    }
}

impl CollaboratorError for MessagingError {
    fn is_transient(&self) -> bool {
        MessagingError::is_transient(self)
    }
}

impl CollaboratorError for RepositoryError {
    fn is_transient(&self) -> bool {
        RepositoryError::is_transient(self)
    }
}

impl CollaboratorError for PushError {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Runs one call against `dependency`, bounded by `limit`.
///
/// Timing out counts as the dependency being unavailable.
pub(crate) async fn bounded<T, E, F>(dependency: Dependency, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: CollaboratorError,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(WorkflowError::from_dependency(
            dependency,
            e.is_transient(),
            e,
        )),
        Err(_) => Err(WorkflowError::Unavailable {
            dependency,
            reason: format!("no response within {limit:?}"),
        }),
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
