use thiserror::Error;

/// Errors that can occur when interacting with the message channel.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The channel could not be reached.
    #[error("Message channel unavailable: {0}")]
    Unavailable(String),

    /// The delivery's lease expired and it was handed to another consumer,
    /// or it was already settled.
    #[error("Lease lost for message {message_id} (attempt {attempt})")]
    LeaseLost { message_id: uuid::Uuid, attempt: u32 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    /// Returns true if retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::Unavailable(_) | MessagingError::Database(_)
        )
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
