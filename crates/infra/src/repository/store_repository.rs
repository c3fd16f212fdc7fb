use std::sync::Arc;

use async_trait::async_trait;

use keystone_core::{AggregateRoot, Entity, ExpectedVersion, Identity, Spec, Specification};
use keystone_events::EventSource;

use super::{Batch, ListQuery, Pagination, Persistable, QueryStats, Repository};
use crate::error::{RepositoryError, RepositoryResult};
use crate::mapper::{ColumnKind, EntityMapper, Record, TableSchema};
use crate::store::{RecordQuery, SortKey, Transaction};
use crate::translate::{QueryFragment, SqlTranslator};
use crate::unit_of_work::Session;

/// How a query filter reaches the store.
struct Filter {
    native: Option<QueryFragment>,
    /// Rows must still pass `is_satisfied_by`.
    residual: bool,
}

impl Filter {
    const NONE: Filter = Filter {
        native: None,
        residual: false,
    };
}

/// Repository over a [`Transaction`] of the owning unit of work.
///
/// Obtained from `UnitOfWork::repository`; every call runs inside that unit of
/// work's transaction and fails with `InvalidState` once it has ended.
pub struct StoreRepository<Tx, M> {
    session: Arc<Session<Tx>>,
    mapper: M,
    stats: Arc<QueryStats>,
}

impl<Tx, M> StoreRepository<Tx, M>
where
    Tx: Transaction,
    M: EntityMapper,
{
    pub(crate) fn new(session: Arc<Session<Tx>>, mapper: M, stats: Arc<QueryStats>) -> Self {
        Self {
            session,
            mapper,
            stats,
        }
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    fn schema(&self) -> &TableSchema {
        self.mapper.schema()
    }

    fn entity_name(&self) -> &str {
        self.schema().entity()
    }

    fn hydrate(&self, records: Vec<Record>) -> RepositoryResult<Vec<M::Entity>> {
        records
            .into_iter()
            .map(|r| self.mapper.to_entity(r).map_err(RepositoryError::from))
            .collect()
    }

    /// Decide how `spec` is evaluated against the current transaction.
    async fn filter_for(&self, spec: Option<&Spec<M::Entity>>) -> RepositoryResult<Filter> {
        let Some(spec) = spec else {
            return Ok(Filter::NONE);
        };
        let dialect = {
            let mut slot = self.session.lock().await;
            Session::active(&mut slot)?.dialect()
        };
        let Some(dialect) = dialect else {
            self.stats.record_in_memory();
            return Ok(Filter {
                native: None,
                residual: true,
            });
        };

        let translator = SqlTranslator::new(dialect, self.schema());
        match translator.translate(spec) {
            Ok(fragment) => {
                self.stats.record_translated();
                Ok(Filter {
                    native: Some(fragment),
                    residual: false,
                })
            }
            Err(untranslatable) => {
                let planned = translator.plan(spec);
                self.stats.record_fallback();
                tracing::warn!(
                    target: "keystone::fallback",
                    entity = self.entity_name(),
                    spec = %spec,
                    reason = %untranslatable.reason,
                    pushed_down = planned.fragment.is_some(),
                    "specification not translatable; filtering in memory"
                );
                Ok(Filter {
                    native: planned.fragment,
                    residual: true,
                })
            }
        }
    }

    async fn select(&self, query: RecordQuery) -> RepositoryResult<Vec<Record>> {
        let mut slot = self.session.lock().await;
        Session::active(&mut slot)?.select(self.schema(), &query).await
    }

    /// Load rows for `query` and apply the residual filter.
    async fn load(&self, spec: Option<&Spec<M::Entity>>, filter: Filter, mut query: RecordQuery) -> RepositoryResult<Vec<M::Entity>> {
        query.filter = filter.native;
        let entities = self.hydrate(self.select(query).await?)?;
        Ok(match (spec, filter.residual) {
            (Some(spec), true) => entities.into_iter().filter(|e| spec.is_satisfied_by(e)).collect(),
            _ => entities,
        })
    }

    fn sort_keys(&self, order_by: &[(String, crate::store::SortDirection)]) -> RepositoryResult<Vec<SortKey>> {
        order_by
            .iter()
            .map(|(field, direction)| {
                let column = self.schema().column_for_field(field).ok_or_else(|| {
                    RepositoryError::Validation(format!(
                        "cannot order {} by unmapped field `{field}`",
                        self.entity_name()
                    ))
                })?;
                if column.kind == ColumnKind::Json {
                    return Err(RepositoryError::Validation(format!(
                        "cannot order {} by JSON field `{field}`",
                        self.entity_name()
                    )));
                }
                Ok(SortKey {
                    column: column.name.clone(),
                    direction: *direction,
                })
            })
            .collect()
    }

    fn enqueue(&self, entity: &mut M::Entity) -> RepositoryResult<()> {
        self.session.enqueue(entity.clear_events())
    }
}

#[async_trait]
impl<Tx, M> Repository<M::Entity> for StoreRepository<Tx, M>
where
    Tx: Transaction,
    M: EntityMapper,
{
    async fn get(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<Option<M::Entity>> {
        let key = self.mapper.encode_id(id);
        let record = {
            let mut slot = self.session.lock().await;
            Session::active(&mut slot)?.fetch(self.schema(), &key).await?
        };
        record
            .map(|r| self.mapper.to_entity(r).map_err(RepositoryError::from))
            .transpose()
    }

    async fn get_or_fail(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<M::Entity> {
        self.get(id)
            .await?
            .ok_or_else(|| RepositoryError::not_found(self.entity_name(), self.mapper.encode_id(id)))
    }

    async fn find(&self, spec: &Spec<M::Entity>) -> RepositoryResult<Vec<M::Entity>> {
        let filter = self.filter_for(Some(spec)).await?;
        self.load(Some(spec), filter, RecordQuery::all()).await
    }

    async fn find_one(&self, spec: &Spec<M::Entity>) -> RepositoryResult<Option<M::Entity>> {
        let filter = self.filter_for(Some(spec)).await?;
        let query = RecordQuery {
            limit: (!filter.residual).then_some(2),
            ..RecordQuery::all()
        };
        let matches = self.load(Some(spec), filter, query).await?;
        if matches.len() > 1 {
            tracing::debug!(
                entity = self.entity_name(),
                spec = %spec,
                matched = matches.len(),
                "find_one matched more than one entity; returning the first by id"
            );
        }
        Ok(matches.into_iter().next())
    }

    async fn count(&self, spec: Option<&Spec<M::Entity>>) -> RepositoryResult<u64> {
        let filter = self.filter_for(spec).await?;
        if filter.residual {
            return Ok(self.load(spec, filter, RecordQuery::all()).await?.len() as u64);
        }
        let mut slot = self.session.lock().await;
        Session::active(&mut slot)?
            .count(self.schema(), filter.native.as_ref())
            .await
    }

    async fn list(&self, query: &ListQuery<M::Entity>) -> RepositoryResult<Vec<M::Entity>> {
        let order = self.sort_keys(&query.order_by)?;
        let filter = self.filter_for(query.filter.as_ref()).await?;

        if filter.residual {
            let record_query = RecordQuery {
                order,
                ..RecordQuery::all()
            };
            let matches = self.load(query.filter.as_ref(), filter, record_query).await?;
            return Ok(query.pagination.apply(matches));
        }

        let Pagination { offset, limit } = query.pagination;
        let record_query = RecordQuery {
            order,
            offset,
            limit,
            ..RecordQuery::all()
        };
        self.load(query.filter.as_ref(), filter, record_query).await
    }

    async fn fetch_batch(
        &self,
        spec: Option<&Spec<M::Entity>>,
        after: Option<&str>,
        batch_size: usize,
    ) -> RepositoryResult<Batch<M::Entity>> {
        if batch_size == 0 {
            return Err(RepositoryError::Validation("batch size must be positive".to_string()));
        }
        let filter = self.filter_for(spec).await?;
        let query = RecordQuery {
            filter: filter.native,
            after_id: after.map(str::to_string),
            limit: Some(batch_size as u64),
            ..RecordQuery::all()
        };

        let records = self.select(query).await?;
        let next_cursor = match records.last() {
            Some(last) if records.len() == batch_size => Some(last.id.clone()),
            _ => None,
        };
        let mut items = self.hydrate(records)?;
        if let (Some(spec), true) = (spec, filter.residual) {
            items.retain(|e| spec.is_satisfied_by(e));
        }
        Ok(Batch { items, next_cursor })
    }

    async fn add(&self, entity: &mut M::Entity) -> RepositoryResult<()> {
        if !entity.is_transient() {
            return Err(RepositoryError::Validation(format!(
                "{} `{}` is already persisted",
                self.entity_name(),
                self.mapper.encode_id(entity.id())
            )));
        }
        let mut record = self.mapper.to_model(entity);
        let assigned = entity
            .id()
            .is_unassigned()
            .then(<M::Entity as Entity>::Id::generate);
        if let Some(id) = &assigned {
            record.id = self.mapper.encode_id(id);
        }
        record.version = 1;
        {
            let mut slot = self.session.lock().await;
            Session::active(&mut slot)?.insert(self.schema(), &record).await?;
        }

        // Only a stored entity keeps its new identity.
        if let Some(id) = assigned {
            entity.assign_id(id);
        }
        entity.set_version(1);
        self.enqueue(entity)
    }

    async fn update(&self, entity: &mut M::Entity) -> RepositoryResult<()> {
        if entity.is_transient() {
            return Err(RepositoryError::Validation(format!(
                "{} has never been persisted; use add",
                self.entity_name()
            )));
        }
        let expected = entity.version();
        let mut record = self.mapper.to_model(entity);
        record.version = expected + 1;
        {
            let mut slot = self.session.lock().await;
            Session::active(&mut slot)?
                .update(self.schema(), &record, expected)
                .await?;
        }
        entity.set_version(expected + 1);
        self.enqueue(entity)
    }

    async fn delete(&self, entity: &mut M::Entity) -> RepositoryResult<()> {
        if entity.is_transient() {
            return Err(RepositoryError::Validation(format!(
                "{} has never been persisted",
                self.entity_name()
            )));
        }
        let key = self.mapper.encode_id(entity.id());
        {
            let mut slot = self.session.lock().await;
            Session::active(&mut slot)?
                .delete(self.schema(), &key, ExpectedVersion::of(&*entity))
                .await?;
        }
        let discarded = entity.clear_events().len();
        if discarded > 0 {
            tracing::debug!(entity = self.entity_name(), id = %key, discarded, "pending events discarded on delete");
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: &<M::Entity as Entity>::Id) -> RepositoryResult<()> {
        let key = self.mapper.encode_id(id);
        let mut slot = self.session.lock().await;
        Session::active(&mut slot)?
            .delete(self.schema(), &key, ExpectedVersion::Any)
            .await
    }
}
