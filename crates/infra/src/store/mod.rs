//! Transactional record stores.
//!
//! A [`Store`] hands out [`Transaction`]s. Repositories only ever talk to a
//! transaction: they read and write flat [`Record`]s described by a
//! [`TableSchema`], and push filters down as [`QueryFragment`]s when the store
//! understands them.
//!
//! ## Optimistic concurrency
//!
//! `update` and `delete` carry the version the caller loaded. A store must
//! check it and write in one step: a mismatch is
//! [`RepositoryError::ConcurrencyConflict`], a missing row is
//! [`RepositoryError::NotFound`].
//!
//! ## Implementations
//!
//! - [`InMemoryStore`]: no native predicates (`dialect()` is `None`); staged
//!   writes are validated against committed versions atomically at commit.
//! - [`SqlStore`]: `sqlx::AnyPool` over Postgres or SQLite.

mod in_memory;
mod sql;

use async_trait::async_trait;

use keystone_core::ExpectedVersion;

use crate::error::RepositoryResult;
use crate::mapper::{Record, TableSchema};
use crate::translate::{Dialect, QueryFragment};

pub use in_memory::{InMemoryStore, InMemoryTransaction};
pub use sql::{SqlStore, SqlTransaction};

/// Sort direction for list queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One `ORDER BY` key. Nulls always sort last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

/// Row selection for [`Transaction::select`].
///
/// Rows are ordered by `order` and then by `id` ascending, so every query has
/// a total, stable order. `after_id` keeps only rows whose id sorts after the
/// cursor and is meant for id-ordered keyset pagination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordQuery {
    pub filter: Option<QueryFragment>,
    pub order: Vec<SortKey>,
    pub after_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Option<QueryFragment>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Source of transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction;

    async fn begin(&self) -> RepositoryResult<Self::Tx>;
}

/// One open store transaction.
///
/// Nothing written through a transaction is visible to others before
/// [`Transaction::commit`]. Dropping a transaction without committing rolls it
/// back.
#[async_trait]
pub trait Transaction: Send + 'static {
    /// Native query dialect, or `None` when filters must be evaluated in memory.
    fn dialect(&self) -> Option<Dialect>;

    async fn fetch(&mut self, schema: &TableSchema, id: &str) -> RepositoryResult<Option<Record>>;

    async fn select(&mut self, schema: &TableSchema, query: &RecordQuery) -> RepositoryResult<Vec<Record>>;

    async fn count(&mut self, schema: &TableSchema, filter: Option<&QueryFragment>) -> RepositoryResult<u64>;

    /// Insert a new row. An existing id is a `Validation` error.
    async fn insert(&mut self, schema: &TableSchema, record: &Record) -> RepositoryResult<()>;

    /// Overwrite the row stored at `expected_version` with `record`.
    async fn update(&mut self, schema: &TableSchema, record: &Record, expected_version: u64) -> RepositoryResult<()>;

    /// Delete a row stored at `expected`.
    async fn delete(&mut self, schema: &TableSchema, id: &str, expected: ExpectedVersion) -> RepositoryResult<()>;

    async fn commit(self) -> RepositoryResult<()>;

    async fn rollback(self) -> RepositoryResult<()>;
}
