//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Failure raised by value objects, aggregates and specifications.
///
/// Every variant is deterministic: retrying the same call with the same state
/// fails the same way. Storage and publication failures live in the
/// infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Rejected input, e.g. an empty SKU or an invalid regular expression.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The aggregate's current state forbids the operation.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Something the operation refers to inside an aggregate does not exist.
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// The message without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::InvariantViolation(msg)
            | Self::InvalidId(msg)
            | Self::Conflict(msg) => msg.clone(),
            Self::NotFound(_) => self.to_string(),
        }
    }
}
