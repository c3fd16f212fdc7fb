//! Infrastructure layer: mapping, query translation, stores, repositories and
//! the unit of work.
//!
//! ```text
//! Spec ──▶ translate ──▶ Repository ──▶ Store transaction
//!                            │
//!                            └─ drained events ──▶ UnitOfWork ──commit──▶ EventPublisher
//! ```

pub mod config;
pub mod error;
pub mod mapper;
pub mod mappers;
pub mod repository;
pub mod store;
pub mod translate;
pub mod unit_of_work;

pub use config::StoreConfig;
pub use error::{RepositoryError, RepositoryResult};
pub use mapper::{Column, ColumnKind, EntityMapper, MappingError, Record, TableSchema};
pub use mappers::{OrderMapper, ProductMapper};
pub use repository::{
    Batch, EntityStream, InstrumentedRepository, ListQuery, Pagination, Persistable, QueryStats,
    Repository, StoreRepository, ValidatingRepository,
};
pub use store::{
    InMemoryStore, InMemoryTransaction, RecordQuery, SortDirection, SortKey, SqlStore,
    SqlTransaction, Store, Transaction,
};
pub use translate::{Dialect, QueryFragment, SqlTranslator, Translation, UntranslatableSpecification};
pub use unit_of_work::{CommitReport, UnitOfWork, UnitOfWorkFactory, UnitOfWorkState};
