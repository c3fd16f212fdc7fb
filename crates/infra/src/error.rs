//! Repository-layer error model.

use thiserror::Error;

use keystone_core::DomainError;

use crate::mapper::MappingError;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Errors surfaced by repositories, stores and units of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Input rejected before or by the store (rule violation, duplicate, bad query).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} `{id}` not found")]
    NotFound { entity: String, id: String },

    /// The stored version moved on since the entity was loaded.
    #[error("concurrency conflict on {entity} `{id}`: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Store or mapping failure.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Operation not allowed in the unit of work's current state.
    #[error("invalid unit of work state: {0}")]
    InvalidState(String),
}

impl RepositoryError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<DomainError> for RepositoryError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.detail())
    }
}

impl From<MappingError> for RepositoryError {
    fn from(err: MappingError) -> Self {
        Self::Persistence(format!("mapping failed: {err}"))
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization failed: {err}"))
    }
}

/// Map a sqlx error raised during `operation`.
///
/// | sqlx error | RepositoryError |
/// |---|---|
/// | unique violation (Postgres `23505`, SQLite `2067`/`1555`) | `Validation("... already exists")` |
/// | anything else | `Persistence` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        let unique = db_err.is_unique_violation()
            || matches!(db_err.code().as_deref(), Some("23505" | "2067" | "1555"));
        if unique {
            return RepositoryError::Validation(format!("{operation}: record already exists"));
        }
    }
    RepositoryError::Persistence(format!("{operation}: {err}"))
}
