//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when building domain values from user input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Port number outside the range a listener may use
    #[error("Invalid port: {value} (expected {min}-{max})")]
    InvalidPort { value: String, min: u16, max: u16 },

    /// Connection id that is not a number
    #[error("Invalid connection id: {value} (expected a non-negative number)")]
    InvalidConnectionId { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
