//! Collection-like access to aggregates.
//!
//! A [`Repository`] loads and saves whole aggregates inside the transaction of
//! the unit of work that created it. Queries take a [`Spec`]: translatable
//! specifications are pushed down to the store, anything else is answered from
//! the tightest translatable superset and filtered in memory. Callers cannot
//! tell the two paths apart except through [`QueryStats`] and the
//! `keystone::fallback` log target.
//!
//! Writes drain the aggregate's pending events into the unit of work, which
//! publishes them only after its transaction commits.

mod decorators;
mod store_repository;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use keystone_core::{AggregateRoot, Attributes, Spec};
use keystone_events::EventSource;

use crate::error::RepositoryResult;
use crate::store::SortDirection;

pub use decorators::{InstrumentedRepository, ValidatingRepository};
pub use store_repository::StoreRepository;

/// Aggregates a repository can store.
pub trait Persistable: AggregateRoot + EventSource + Attributes + Send + Sync + 'static {}

impl<T> Persistable for T where T: AggregateRoot + EventSource + Attributes + Send + Sync + 'static {}

/// Offset/limit window over an ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    pub offset: u64,
    /// `None` returns everything after `offset`.
    pub limit: Option<u64>,
}

impl Pagination {
    pub fn new(offset: u64, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    /// Apply the window to an already ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let limit = self
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        items.into_iter().skip(offset).take(limit).collect()
    }
}

/// Filter, ordering and window for [`Repository::list`].
///
/// Results are ordered by `order_by` (nulls last) and then by id, so the
/// default order is stable across calls.
pub struct ListQuery<E> {
    pub filter: Option<Spec<E>>,
    pub order_by: Vec<(String, SortDirection)>,
    pub pagination: Pagination,
}

impl<E> Default for ListQuery<E> {
    fn default() -> Self {
        Self {
            filter: None,
            order_by: Vec::new(),
            pagination: Pagination::default(),
        }
    }
}

impl<E> Clone for ListQuery<E> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            pagination: self.pagination,
        }
    }
}

impl<E> core::fmt::Debug for ListQuery<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListQuery")
            .field("filter", &self.filter.as_ref().map(ToString::to_string))
            .field("order_by", &self.order_by)
            .field("pagination", &self.pagination)
            .finish()
    }
}

impl<E> ListQuery<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, spec: Spec<E>) -> Self {
        self.filter = Some(spec);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.pagination.offset = offset;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.pagination.limit = Some(limit);
        self
    }
}

/// One keyset page from [`Repository::fetch_batch`].
#[derive(Debug)]
pub struct Batch<E> {
    pub items: Vec<E>,
    /// Cursor for the next call; `None` once the table is exhausted.
    ///
    /// A batch can be short (even empty) while a cursor is still returned,
    /// when rows were scanned but rejected by in-memory filtering.
    pub next_cursor: Option<String>,
}

/// Counters describing how queries were answered.
#[derive(Debug, Default)]
pub struct QueryStats {
    translated: AtomicU64,
    fallbacks: AtomicU64,
    in_memory: AtomicU64,
}

impl QueryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries pushed down exactly.
    pub fn translated(&self) -> u64 {
        self.translated.load(Ordering::Relaxed)
    }

    /// Queries answered from a superset plus in-memory filtering.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Queries against stores without native predicates.
    pub fn in_memory(&self) -> u64 {
        self.in_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn record_translated(&self) {
        self.translated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_in_memory(&self) {
        self.in_memory.fetch_add(1, Ordering::Relaxed);
    }
}

/// Aggregate persistence bound to one unit of work.
#[async_trait]
pub trait Repository<E: Persistable>: Send + Sync {
    async fn get(&self, id: &E::Id) -> RepositoryResult<Option<E>>;

    /// Like [`Repository::get`], but a missing entity is `NotFound`.
    async fn get_or_fail(&self, id: &E::Id) -> RepositoryResult<E>;

    /// All matching entities, ordered by id.
    async fn find(&self, spec: &Spec<E>) -> RepositoryResult<Vec<E>>;

    /// First match by id order.
    async fn find_one(&self, spec: &Spec<E>) -> RepositoryResult<Option<E>>;

    async fn count(&self, spec: Option<&Spec<E>>) -> RepositoryResult<u64>;

    async fn list(&self, query: &ListQuery<E>) -> RepositoryResult<Vec<E>>;

    /// Up to `batch_size` rows with ids after `after`, ordered by id.
    async fn fetch_batch(
        &self,
        spec: Option<&Spec<E>>,
        after: Option<&str>,
        batch_size: usize,
    ) -> RepositoryResult<Batch<E>>;

    /// Persist a new entity at version 1, assigning an identity if needed.
    async fn add(&self, entity: &mut E) -> RepositoryResult<()>;

    /// Conditionally overwrite the stored state and bump the version.
    async fn update(&self, entity: &mut E) -> RepositoryResult<()>;

    /// Delete at the entity's version; its pending events are discarded.
    async fn delete(&self, entity: &mut E) -> RepositoryResult<()>;

    async fn delete_by_id(&self, id: &E::Id) -> RepositoryResult<()>;

    /// Stops at the first failure. Atomic only through the unit of work.
    async fn add_many(&self, entities: &mut [E]) -> RepositoryResult<()> {
        for entity in entities.iter_mut() {
            self.add(entity).await?;
        }
        Ok(())
    }

    async fn update_many(&self, entities: &mut [E]) -> RepositoryResult<()> {
        for entity in entities.iter_mut() {
            self.update(entity).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, entities: &mut [E]) -> RepositoryResult<()> {
        for entity in entities.iter_mut() {
            self.delete(entity).await?;
        }
        Ok(())
    }

    /// Lazily iterate matching entities in id order, `batch_size` rows at a time.
    fn stream(&self, spec: Option<Spec<E>>, batch_size: usize) -> EntityStream<'_, E, Self> {
        EntityStream::new(self, spec, batch_size)
    }
}

/// Keyset-paginated cursor over a repository.
///
/// Holds at most one batch in memory. The stream ends after the last batch
/// or the first error; call [`Repository::stream`] again to restart.
pub struct EntityStream<'r, E: Persistable, R: ?Sized> {
    repository: &'r R,
    spec: Option<Spec<E>>,
    batch_size: usize,
    cursor: Option<String>,
    buffer: VecDeque<E>,
    exhausted: bool,
}

impl<'r, E, R> EntityStream<'r, E, R>
where
    E: Persistable,
    R: Repository<E> + ?Sized,
{
    pub fn new(repository: &'r R, spec: Option<Spec<E>>, batch_size: usize) -> Self {
        Self {
            repository,
            spec,
            batch_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next(&mut self) -> Option<RepositoryResult<E>> {
        loop {
            if let Some(entity) = self.buffer.pop_front() {
                return Some(Ok(entity));
            }
            if self.exhausted {
                return None;
            }

            let batch = self
                .repository
                .fetch_batch(self.spec.as_ref(), self.cursor.as_deref(), self.batch_size)
                .await;
            match batch {
                Ok(batch) => {
                    self.exhausted = batch.next_cursor.is_none();
                    self.cursor = batch.next_cursor;
                    self.buffer.extend(batch.items);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }

    /// Drain the rest of the stream.
    pub async fn try_collect(mut self) -> RepositoryResult<Vec<E>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}
