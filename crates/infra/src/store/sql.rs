//! `sqlx::Any`-backed store for Postgres and SQLite.
//!
//! Column values are written in a dialect-neutral representation: booleans,
//! 64-bit integers, doubles and text. Timestamps are stored as canonical
//! RFC 3339 text and JSON/list values as JSON text; both are decoded back into
//! `Value::Timestamp` / `Value::Json` when read.
//!
//! ## Error mapping
//!
//! | sqlx error | RepositoryError |
//! |---|---|
//! | unique violation on insert | `Validation` ("already exists") |
//! | anything else | `Persistence` |
//!
//! Conditional writes that touch no row are disambiguated with a follow-up
//! version lookup inside the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row};
use tracing::instrument;

use keystone_core::{ExpectedVersion, Value};
use keystone_core::value::canonical_timestamp;

use super::{RecordQuery, Store, Transaction};
use crate::config::StoreConfig;
use crate::error::{RepositoryError, RepositoryResult, map_sqlx_error};
use crate::mapper::{ColumnKind, Record, TableSchema};
use crate::translate::{Dialect, QueryFragment, quote_ident};

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

/// Connection pool plus the dialect its URL selected.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    /// Open a pool for `config.database_url`.
    ///
    /// In-memory SQLite databases exist per connection, so they get a single
    /// connection that is never recycled.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &StoreConfig) -> RepositoryResult<Self> {
        let dialect = Dialect::from_url(&config.database_url).ok_or_else(|| {
            RepositoryError::Validation("unsupported database url scheme".to_string())
        })?;
        sqlx::any::install_default_drivers();

        let mut options = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.is_in_memory_sqlite() {
            options = options.max_connections(1).idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        tracing::info!(?dialect, "store connected");
        Ok(Self { pool, dialect })
    }

    pub fn from_pool(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// `CREATE TABLE IF NOT EXISTS` for `schema`.
    #[instrument(skip(self, schema), fields(table = schema.table()), err)]
    pub async fn ensure_table(&self, schema: &TableSchema) -> RepositoryResult<()> {
        let ddl = create_table_sql(self.dialect, schema);
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqlStore {
    type Tx = SqlTransaction;

    async fn begin(&self) -> RepositoryResult<SqlTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(SqlTransaction {
            tx,
            dialect: self.dialect,
        })
    }
}

fn column_type(dialect: Dialect, kind: ColumnKind) -> &'static str {
    match (dialect, kind) {
        (_, ColumnKind::Bool) => "BOOLEAN",
        (Dialect::Postgres, ColumnKind::Int) => "BIGINT",
        (Dialect::Sqlite, ColumnKind::Int) => "INTEGER",
        (Dialect::Postgres, ColumnKind::Float) => "DOUBLE PRECISION",
        (Dialect::Sqlite, ColumnKind::Float) => "REAL",
        (_, ColumnKind::Text | ColumnKind::Timestamp | ColumnKind::Json) => "TEXT",
    }
}

fn create_table_sql(dialect: Dialect, schema: &TableSchema) -> String {
    let mut columns = vec![
        format!("{} TEXT PRIMARY KEY", quote_ident(TableSchema::ID_COLUMN)),
        format!("{} BIGINT NOT NULL", quote_ident(TableSchema::VERSION_COLUMN)),
    ];
    columns.extend(
        schema
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), column_type(dialect, c.kind))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(schema.table()),
        columns.join(", ")
    )
}

fn select_list(schema: &TableSchema) -> String {
    [TableSchema::ID_COLUMN, TableSchema::VERSION_COLUMN]
        .into_iter()
        .map(quote_ident)
        .chain(schema.columns().iter().map(|c| quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `id` as an ordered expression; Postgres compares byte-wise under "C".
fn id_expr(dialect: Dialect) -> String {
    let id = quote_ident(TableSchema::ID_COLUMN);
    match dialect {
        Dialect::Postgres => format!("{id} COLLATE \"C\""),
        Dialect::Sqlite => id,
    }
}

fn order_expr(dialect: Dialect, schema: &TableSchema, column: &str) -> String {
    let kind = match column {
        TableSchema::ID_COLUMN => Some(ColumnKind::Text),
        _ => schema.columns().iter().find(|c| c.name == column).map(|c| c.kind),
    };
    match (dialect, kind) {
        (Dialect::Postgres, Some(ColumnKind::Text | ColumnKind::Timestamp)) => {
            format!("{} COLLATE \"C\"", quote_ident(column))
        }
        _ => quote_ident(column),
    }
}

/// Full `SELECT` statement for `query`.
fn select_statement(dialect: Dialect, schema: &TableSchema, query: &RecordQuery) -> QueryFragment {
    let mut stmt = QueryFragment::sql(format!(
        "SELECT {} FROM {}",
        select_list(schema),
        quote_ident(schema.table())
    ));

    let mut conditions = Vec::new();
    if let Some(filter) = &query.filter {
        conditions.push(filter.clone());
    }
    if let Some(after) = &query.after_id {
        let mut cursor = QueryFragment::sql(format!("{} > ", id_expr(dialect)));
        cursor.push_param(after.clone());
        conditions.push(cursor);
    }
    for (i, condition) in conditions.into_iter().enumerate() {
        stmt.push_sql(if i == 0 { " WHERE " } else { " AND " });
        stmt.append(condition);
    }

    let mut order: Vec<String> = query
        .order
        .iter()
        .map(|key| {
            format!(
                "{} {} NULLS LAST",
                order_expr(dialect, schema, &key.column),
                key.direction.as_sql()
            )
        })
        .collect();
    order.push(format!("{} ASC", id_expr(dialect)));
    stmt.push_sql(format!(" ORDER BY {}", order.join(", ")));

    match (dialect, query.limit) {
        (_, Some(limit)) => stmt.push_sql(format!(" LIMIT {limit} OFFSET {}", query.offset)),
        (Dialect::Postgres, None) => stmt.push_sql(format!(" OFFSET {}", query.offset)),
        (Dialect::Sqlite, None) => stmt.push_sql(format!(" LIMIT -1 OFFSET {}", query.offset)),
    };
    stmt
}

/// Bind one value. `kind` picks the type of a bound NULL.
fn bind_value<'q>(query: AnyQuery<'q>, value: &Value, kind: Option<ColumnKind>) -> AnyQuery<'q> {
    match value {
        Value::Null => match kind {
            Some(ColumnKind::Bool) => query.bind(Option::<bool>::None),
            Some(ColumnKind::Int) => query.bind(Option::<i64>::None),
            Some(ColumnKind::Float) => query.bind(Option::<f64>::None),
            _ => query.bind(Option::<String>::None),
        },
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => match kind {
            Some(ColumnKind::Float) => query.bind(*i as f64),
            _ => query.bind(*i),
        },
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Timestamp(ts) => query.bind(canonical_timestamp(ts)),
        Value::List(_) | Value::Json(_) => query.bind(value.to_json().to_string()),
    }
}

fn bind_all<'q>(sql: &'q str, params: &[(Value, Option<ColumnKind>)]) -> AnyQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |q, (value, kind)| bind_value(q, value, *kind))
}

fn untyped(params: Vec<Value>) -> Vec<(Value, Option<ColumnKind>)> {
    params.into_iter().map(|v| (v, None)).collect()
}

fn decode_column(row: &AnyRow, name: &str, kind: ColumnKind) -> RepositoryResult<Value> {
    let decode_err = |e: sqlx::Error| RepositoryError::persistence(format!("decode column `{name}`: {e}"));
    let value = match kind {
        ColumnKind::Bool => match row.try_get::<Option<bool>, _>(name) {
            Ok(v) => v.map(Value::Bool),
            Err(_) => row
                .try_get::<Option<i64>, _>(name)
                .map_err(decode_err)?
                .map(|i| Value::Bool(i != 0)),
        },
        ColumnKind::Int => row.try_get::<Option<i64>, _>(name).map_err(decode_err)?.map(Value::Int),
        ColumnKind::Float => match row.try_get::<Option<f64>, _>(name) {
            Ok(v) => v.map(Value::Float),
            Err(_) => row
                .try_get::<Option<i64>, _>(name)
                .map_err(decode_err)?
                .map(|i| Value::Float(i as f64)),
        },
        ColumnKind::Text => row.try_get::<Option<String>, _>(name).map_err(decode_err)?.map(Value::Text),
        ColumnKind::Timestamp => row
            .try_get::<Option<String>, _>(name)
            .map_err(decode_err)?
            .map(|s| match DateTime::parse_from_rfc3339(&s) {
                Ok(ts) => Value::Timestamp(ts.with_timezone(&Utc)),
                Err(_) => Value::Text(s),
            }),
        ColumnKind::Json => row
            .try_get::<Option<String>, _>(name)
            .map_err(decode_err)?
            .map(|s| match serde_json::from_str(&s) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::Text(s),
            }),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_record(schema: &TableSchema, row: &AnyRow) -> RepositoryResult<Record> {
    let id: String = row
        .try_get(TableSchema::ID_COLUMN)
        .map_err(|e| RepositoryError::persistence(format!("decode id: {e}")))?;
    let version: i64 = row
        .try_get(TableSchema::VERSION_COLUMN)
        .map_err(|e| RepositoryError::persistence(format!("decode version: {e}")))?;

    let mut record = Record::new(id, u64::try_from(version).unwrap_or_default());
    for column in schema.columns() {
        record.set(column.name.clone(), decode_column(row, &column.name, column.kind)?);
    }
    Ok(record)
}

/// Record values in schema column order, typed for binding.
fn column_params(schema: &TableSchema, record: &Record) -> Vec<(Value, Option<ColumnKind>)> {
    schema
        .columns()
        .iter()
        .map(|c| (record.values.get(&c.name).cloned().unwrap_or(Value::Null), Some(c.kind)))
        .collect()
}

fn version_param(version: u64) -> (Value, Option<ColumnKind>) {
    (Value::Int(i64::try_from(version).unwrap_or(i64::MAX)), Some(ColumnKind::Int))
}

/// Open transaction on a [`SqlStore`] connection.
///
/// Dropping it without commit returns the connection with the transaction
/// rolled back.
pub struct SqlTransaction {
    tx: sqlx::Transaction<'static, Any>,
    dialect: Dialect,
}

impl core::fmt::Debug for SqlTransaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SqlTransaction")
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl SqlTransaction {
    async fn stored_version(&mut self, schema: &TableSchema, id: &str) -> RepositoryResult<Option<u64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            quote_ident(TableSchema::VERSION_COLUMN),
            quote_ident(schema.table()),
            quote_ident(TableSchema::ID_COLUMN),
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("stored_version", e))?;
        row.map(|r| {
            r.try_get::<i64, _>(0)
                .map(|v| u64::try_from(v).unwrap_or_default())
                .map_err(|e| RepositoryError::persistence(format!("decode version: {e}")))
        })
        .transpose()
    }

    /// Explain a conditional write that touched no row.
    async fn missed_write(&mut self, schema: &TableSchema, id: &str, expected: u64) -> RepositoryError {
        match self.stored_version(schema, id).await {
            Ok(Some(actual)) => RepositoryError::ConcurrencyConflict {
                entity: schema.entity().to_string(),
                id: id.to_string(),
                expected,
                actual,
            },
            Ok(None) => RepositoryError::not_found(schema.entity(), id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    fn dialect(&self) -> Option<Dialect> {
        Some(self.dialect)
    }

    async fn fetch(&mut self, schema: &TableSchema, id: &str) -> RepositoryResult<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            select_list(schema),
            quote_ident(schema.table()),
            quote_ident(TableSchema::ID_COLUMN),
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.map(|r| decode_record(schema, &r)).transpose()
    }

    async fn select(&mut self, schema: &TableSchema, query: &RecordQuery) -> RepositoryResult<Vec<Record>> {
        let (sql, params) = select_statement(self.dialect, schema, query).render(self.dialect);
        let params = untyped(params);
        tracing::debug!(table = schema.table(), %sql, params = params.len(), "select");

        let rows = bind_all(&sql, &params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("select", e))?;
        rows.iter().map(|r| decode_record(schema, r)).collect()
    }

    async fn count(&mut self, schema: &TableSchema, filter: Option<&QueryFragment>) -> RepositoryResult<u64> {
        let mut stmt = QueryFragment::sql(format!("SELECT COUNT(*) FROM {}", quote_ident(schema.table())));
        if let Some(filter) = filter {
            stmt.push_sql(" WHERE ");
            stmt.append(filter.clone());
        }
        let (sql, params) = stmt.render(self.dialect);
        let params = untyped(params);

        let row = bind_all(&sql, &params)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| RepositoryError::persistence(format!("decode count: {e}")))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn insert(&mut self, schema: &TableSchema, record: &Record) -> RepositoryResult<()> {
        let mut names = vec![
            quote_ident(TableSchema::ID_COLUMN),
            quote_ident(TableSchema::VERSION_COLUMN),
        ];
        names.extend(schema.columns().iter().map(|c| quote_ident(&c.name)));

        let mut params = vec![(Value::Text(record.id.clone()), Some(ColumnKind::Text)), version_param(record.version)];
        params.extend(column_params(schema, record));

        let placeholders: Vec<String> = (1..=params.len()).map(|i| self.dialect.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(schema.table()),
            names.join(", "),
            placeholders.join(", ")
        );

        bind_all(&sql, &params)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match map_sqlx_error("insert", e) {
                RepositoryError::Validation(_) => RepositoryError::Validation(format!(
                    "{} `{}` already exists",
                    schema.entity(),
                    record.id
                )),
                other => other,
            })?;
        Ok(())
    }

    async fn update(&mut self, schema: &TableSchema, record: &Record, expected_version: u64) -> RepositoryResult<()> {
        let mut params = vec![version_param(record.version)];
        params.extend(column_params(schema, record));

        let mut assignments = vec![format!(
            "{} = {}",
            quote_ident(TableSchema::VERSION_COLUMN),
            self.dialect.placeholder(1)
        )];
        assignments.extend(
            schema
                .columns()
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = {}", quote_ident(&c.name), self.dialect.placeholder(i + 2))),
        );

        params.push((Value::Text(record.id.clone()), Some(ColumnKind::Text)));
        params.push(version_param(expected_version));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {} AND {} = {}",
            quote_ident(schema.table()),
            assignments.join(", "),
            quote_ident(TableSchema::ID_COLUMN),
            self.dialect.placeholder(params.len() - 1),
            quote_ident(TableSchema::VERSION_COLUMN),
            self.dialect.placeholder(params.len()),
        );

        let result = bind_all(&sql, &params)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        if result.rows_affected() == 0 {
            return Err(self.missed_write(schema, &record.id, expected_version).await);
        }
        Ok(())
    }

    async fn delete(&mut self, schema: &TableSchema, id: &str, expected: ExpectedVersion) -> RepositoryResult<()> {
        let mut params = vec![(Value::Text(id.to_string()), Some(ColumnKind::Text))];
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            quote_ident(schema.table()),
            quote_ident(TableSchema::ID_COLUMN),
            self.dialect.placeholder(1)
        );
        if let Some(version) = expected.exact() {
            params.push(version_param(version));
            sql.push_str(&format!(
                " AND {} = {}",
                quote_ident(TableSchema::VERSION_COLUMN),
                self.dialect.placeholder(2)
            ));
        }

        let result = bind_all(&sql, &params)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        if result.rows_affected() == 0 {
            return Err(match expected.exact() {
                Some(version) => self.missed_write(schema, id, version).await,
                None => RepositoryError::not_found(schema.entity(), id),
            });
        }
        Ok(())
    }

    async fn commit(self) -> RepositoryResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> RepositoryResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}
