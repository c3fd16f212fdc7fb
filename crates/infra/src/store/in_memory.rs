use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use keystone_core::{ExpectedVersion, Value};

use super::{RecordQuery, SortDirection, SortKey, Store, Transaction};
use crate::error::{RepositoryError, RepositoryResult};
use crate::mapper::{Record, TableSchema};
use crate::translate::{Dialect, QueryFragment};

type Tables = HashMap<String, BTreeMap<String, Record>>;

/// In-memory record store.
///
/// Intended for tests/dev and as the reference oracle for query semantics:
/// it accepts no native filters, so repositories evaluate every specification
/// with `is_satisfied_by`. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows in `table`, ordered by id.
    pub fn snapshot(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .map(|tables| tables.get(table).map(|rows| rows.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> RepositoryResult<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            staged: BTreeMap::new(),
        })
    }
}

/// What the committed state must look like for a staged write to apply.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Absent,
    Version(u64),
}

#[derive(Debug)]
struct Staged {
    entity: String,
    expect: Expect,
    /// `None` stages a delete.
    write: Option<Record>,
}

/// Transaction over an [`InMemoryStore`].
///
/// Writes are staged locally (read-your-writes) and applied under the store's
/// write lock on commit, after every staged expectation has been checked
/// against the committed rows.
#[derive(Debug)]
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    staged: BTreeMap<(String, String), Staged>,
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::persistence("in-memory store lock poisoned")
}

fn conflict(schema: &TableSchema, id: &str, expected: u64, actual: u64) -> RepositoryError {
    RepositoryError::ConcurrencyConflict {
        entity: schema.entity().to_string(),
        id: id.to_string(),
        expected,
        actual,
    }
}

impl InMemoryTransaction {
    fn committed(&self, table: &str, id: &str) -> RepositoryResult<Option<Record>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    /// Row as seen by this transaction.
    fn visible(&self, table: &str, id: &str) -> RepositoryResult<Option<Record>> {
        match self.staged.get(&(table.to_string(), id.to_string())) {
            Some(staged) => Ok(staged.write.clone()),
            None => self.committed(table, id),
        }
    }

    fn visible_rows(&self, table: &str) -> RepositoryResult<Vec<Record>> {
        let mut rows = {
            let tables = self.tables.read().map_err(poisoned)?;
            tables.get(table).cloned().unwrap_or_default()
        };
        for ((staged_table, id), staged) in &self.staged {
            if staged_table != table {
                continue;
            }
            match &staged.write {
                Some(record) => rows.insert(id.clone(), record.clone()),
                None => rows.remove(id),
            };
        }
        Ok(rows.into_values().collect())
    }

    /// Stage a write, keeping the first expectation recorded for the row.
    fn stage(&mut self, schema: &TableSchema, id: &str, expect: Expect, write: Option<Record>) {
        let key = (schema.table().to_string(), id.to_string());
        let expect = self.staged.get(&key).map(|s| s.expect).unwrap_or(expect);
        self.staged.insert(
            key,
            Staged {
                entity: schema.entity().to_string(),
                expect,
                write,
            },
        );
    }

    fn reject_filter(filter: Option<&QueryFragment>) -> RepositoryResult<()> {
        match filter {
            Some(_) => Err(RepositoryError::persistence(
                "in-memory store cannot evaluate native filters",
            )),
            None => Ok(()),
        }
    }
}

fn compare_key(a: &Record, b: &Record, key: &SortKey) -> Ordering {
    let a = a.get(&key.column).unwrap_or(Value::Null);
    let b = b.get(&key.column).unwrap_or(Value::Null);
    match (a.is_null(), b.is_null(), key.direction) {
        (false, false, SortDirection::Desc) => b.sort_cmp(&a),
        _ => a.sort_cmp(&b),
    }
}

fn order_rows(rows: &mut [Record], order: &[SortKey]) {
    rows.sort_by(|a, b| {
        order
            .iter()
            .map(|key| compare_key(a, b, key))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.id.as_bytes().cmp(b.id.as_bytes()))
    });
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn dialect(&self) -> Option<Dialect> {
        None
    }

    async fn fetch(&mut self, schema: &TableSchema, id: &str) -> RepositoryResult<Option<Record>> {
        self.visible(schema.table(), id)
    }

    async fn select(&mut self, schema: &TableSchema, query: &RecordQuery) -> RepositoryResult<Vec<Record>> {
        Self::reject_filter(query.filter.as_ref())?;

        let mut rows = self.visible_rows(schema.table())?;
        if let Some(after) = &query.after_id {
            rows.retain(|r| r.id.as_bytes() > after.as_bytes());
        }
        order_rows(&mut rows, &query.order);

        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&mut self, schema: &TableSchema, filter: Option<&QueryFragment>) -> RepositoryResult<u64> {
        Self::reject_filter(filter)?;
        Ok(self.visible_rows(schema.table())?.len() as u64)
    }

    async fn insert(&mut self, schema: &TableSchema, record: &Record) -> RepositoryResult<()> {
        if self.visible(schema.table(), &record.id)?.is_some() {
            return Err(RepositoryError::Validation(format!(
                "{} `{}` already exists",
                schema.entity(),
                record.id
            )));
        }
        self.stage(schema, &record.id, Expect::Absent, Some(record.clone()));
        Ok(())
    }

    async fn update(&mut self, schema: &TableSchema, record: &Record, expected_version: u64) -> RepositoryResult<()> {
        let current = self
            .visible(schema.table(), &record.id)?
            .ok_or_else(|| RepositoryError::not_found(schema.entity(), record.id.clone()))?;
        if current.version != expected_version {
            return Err(conflict(schema, &record.id, expected_version, current.version));
        }
        self.stage(schema, &record.id, Expect::Version(expected_version), Some(record.clone()));
        Ok(())
    }

    async fn delete(&mut self, schema: &TableSchema, id: &str, expected: ExpectedVersion) -> RepositoryResult<()> {
        let current = self
            .visible(schema.table(), id)?
            .ok_or_else(|| RepositoryError::not_found(schema.entity(), id))?;
        if let Some(expected) = expected.exact().filter(|_| !expected.matches(current.version)) {
            return Err(conflict(schema, id, expected, current.version));
        }
        self.stage(schema, id, Expect::Version(current.version), None);
        Ok(())
    }

    async fn commit(self) -> RepositoryResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;

        for ((table, id), staged) in &self.staged {
            let committed = tables.get(table).and_then(|rows| rows.get(id));
            match (staged.expect, committed) {
                (Expect::Absent, None) => {}
                (Expect::Absent, Some(_)) => {
                    return Err(RepositoryError::Validation(format!(
                        "{} `{id}` already exists",
                        staged.entity
                    )));
                }
                (Expect::Version(_), None) => {
                    return Err(RepositoryError::not_found(&staged.entity, id.clone()));
                }
                (Expect::Version(expected), Some(row)) if row.version != expected => {
                    return Err(RepositoryError::ConcurrencyConflict {
                        entity: staged.entity.clone(),
                        id: id.clone(),
                        expected,
                        actual: row.version,
                    });
                }
                (Expect::Version(_), Some(_)) => {}
            }
        }

        for ((table, id), staged) in self.staged {
            let rows = tables.entry(table).or_default();
            match staged.write {
                Some(record) => rows.insert(id, record),
                None => rows.remove(&id),
            };
        }
        Ok(())
    }

    async fn rollback(self) -> RepositoryResult<()> {
        Ok(())
    }
}
