//! Repository decorators.
//!
//! Both wrap any [`Repository`] and implement it again, so they stack:
//! `InstrumentedRepository::new(ValidatingRepository::new(repo, rules))`.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use keystone_core::{Entity, RuleSet, Spec};

use super::{Batch, ListQuery, Persistable, Repository};
use crate::error::{RepositoryError, RepositoryResult};

/// Wraps each call in a `repository` span and logs its duration and outcome.
pub struct InstrumentedRepository<R> {
    inner: R,
    entity: &'static str,
}

impl<R> InstrumentedRepository<R> {
    pub fn new(inner: R, entity: &'static str) -> Self {
        Self { inner, entity }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn observe<T, F>(&self, operation: &'static str, call: F) -> RepositoryResult<T>
    where
        F: Future<Output = RepositoryResult<T>> + Send,
    {
        let span = tracing::info_span!("repository", entity = self.entity, operation);
        let started = Instant::now();
        let result = call.instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        span.in_scope(|| match &result {
            Ok(_) => tracing::debug!(elapsed_ms, outcome = "ok", "repository call finished"),
            Err(err) => tracing::warn!(elapsed_ms, outcome = "error", error = %err, "repository call failed"),
        });
        result
    }
}

#[async_trait]
impl<E, R> Repository<E> for InstrumentedRepository<R>
where
    E: Persistable,
    R: Repository<E>,
{
    async fn get(&self, id: &E::Id) -> RepositoryResult<Option<E>> {
        self.observe("get", self.inner.get(id)).await
    }

    async fn get_or_fail(&self, id: &E::Id) -> RepositoryResult<E> {
        self.observe("get_or_fail", self.inner.get_or_fail(id)).await
    }

    async fn find(&self, spec: &Spec<E>) -> RepositoryResult<Vec<E>> {
        self.observe("find", self.inner.find(spec)).await
    }

    async fn find_one(&self, spec: &Spec<E>) -> RepositoryResult<Option<E>> {
        self.observe("find_one", self.inner.find_one(spec)).await
    }

    async fn count(&self, spec: Option<&Spec<E>>) -> RepositoryResult<u64> {
        self.observe("count", self.inner.count(spec)).await
    }

    async fn list(&self, query: &ListQuery<E>) -> RepositoryResult<Vec<E>> {
        self.observe("list", self.inner.list(query)).await
    }

    async fn fetch_batch(
        &self,
        spec: Option<&Spec<E>>,
        after: Option<&str>,
        batch_size: usize,
    ) -> RepositoryResult<Batch<E>> {
        self.observe("fetch_batch", self.inner.fetch_batch(spec, after, batch_size))
            .await
    }

    async fn add(&self, entity: &mut E) -> RepositoryResult<()> {
        self.observe("add", self.inner.add(entity)).await
    }

    async fn update(&self, entity: &mut E) -> RepositoryResult<()> {
        self.observe("update", self.inner.update(entity)).await
    }

    async fn delete(&self, entity: &mut E) -> RepositoryResult<()> {
        self.observe("delete", self.inner.delete(entity)).await
    }

    async fn delete_by_id(&self, id: &E::Id) -> RepositoryResult<()> {
        self.observe("delete_by_id", self.inner.delete_by_id(id)).await
    }
}

/// Checks a [`RuleSet`] before `add` and `update` reach the inner repository.
pub struct ValidatingRepository<R, E> {
    inner: R,
    rules: RuleSet<E>,
}

impl<R, E> ValidatingRepository<R, E> {
    pub fn new(inner: R, rules: RuleSet<E>) -> Self {
        Self { inner, rules }
    }
}

impl<R, E> ValidatingRepository<R, E>
where
    E: Persistable,
{
    fn validate(&self, entity: &E) -> RepositoryResult<()> {
        self.rules.check(entity).map_err(|err| {
            tracing::debug!(id = %entity.id(), error = %err, "entity rejected by rules");
            RepositoryError::from(err)
        })
    }
}

#[async_trait]
impl<E, R> Repository<E> for ValidatingRepository<R, E>
where
    E: Persistable,
    R: Repository<E>,
{
    async fn get(&self, id: &E::Id) -> RepositoryResult<Option<E>> {
        self.inner.get(id).await
    }

    async fn get_or_fail(&self, id: &E::Id) -> RepositoryResult<E> {
        self.inner.get_or_fail(id).await
    }

    async fn find(&self, spec: &Spec<E>) -> RepositoryResult<Vec<E>> {
        self.inner.find(spec).await
    }

    async fn find_one(&self, spec: &Spec<E>) -> RepositoryResult<Option<E>> {
        self.inner.find_one(spec).await
    }

    async fn count(&self, spec: Option<&Spec<E>>) -> RepositoryResult<u64> {
        self.inner.count(spec).await
    }

    async fn list(&self, query: &ListQuery<E>) -> RepositoryResult<Vec<E>> {
        self.inner.list(query).await
    }

    async fn fetch_batch(
        &self,
        spec: Option<&Spec<E>>,
        after: Option<&str>,
        batch_size: usize,
    ) -> RepositoryResult<Batch<E>> {
        self.inner.fetch_batch(spec, after, batch_size).await
    }

    async fn add(&self, entity: &mut E) -> RepositoryResult<()> {
        self.validate(entity)?;
        self.inner.add(entity).await
    }

    async fn update(&self, entity: &mut E) -> RepositoryResult<()> {
        self.validate(entity)?;
        self.inner.update(entity).await
    }

    async fn delete(&self, entity: &mut E) -> RepositoryResult<()> {
        self.inner.delete(entity).await
    }

    async fn delete_by_id(&self, id: &E::Id) -> RepositoryResult<()> {
        self.inner.delete_by_id(id).await
    }
}
