//! Order error types.

use thiserror::Error;

/// Validation failures for an incoming order request. Always terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Customer ID is required.
    #[error("Customer ID is required")]
    CustomerIdRequired,

    /// Order must have at least one item.
    #[error("Order must have at least one item")]
    NoItems,

    /// An item line has no product.
    #[error("Item line {line} has no product ID")]
    ProductIdRequired { line: usize },

    /// Invalid quantity (must be greater than 0).
    #[error("Invalid quantity {quantity} for product {product_id}: must be greater than 0")]
    InvalidQuantity { product_id: String, quantity: i32 },
}

/// Errors raised by an [`OrderRepository`](crate::OrderRepository).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The relational store could not be reached.
    #[error("Order store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A constraint other than the correlation-id key rejected the write.
    /// Retrying will not help.
    #[error("Order integrity violation: {0}")]
    Integrity(String),
}

impl RepositoryError {
    /// Returns true if retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RepositoryError::Integrity(_))
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
