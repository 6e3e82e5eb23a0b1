use thiserror::Error;

/// Errors that can occur when interacting with the transient stores.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The backing store could not be reached.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be parsed.
    #[error("Corrupt value under key {key}: {value:?}")]
    CorruptValue { key: String, value: String },
}

impl StateStoreError {
    /// Returns true if retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StateStoreError::CorruptValue { .. })
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
