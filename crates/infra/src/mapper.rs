//! Entity ↔ persistence record mapping.
//!
//! A mapper is stateless: it owns a [`TableSchema`] describing the table and
//! converts between an aggregate and a flat [`Record`] of column values. The
//! schema doubles as the field → column mapping the translator uses, so a field
//! is queryable natively exactly when a column declares it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use keystone_core::{Entity, Value};

use crate::repository::Persistable;

/// Storage type of a column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
    /// Stored as fixed-width RFC 3339 text (see `keystone_core::value::canonical_timestamp`).
    Timestamp,
    /// Stored as JSON text. Holds lists and documents.
    Json,
}

impl ColumnKind {
    /// Kinds with a total order usable in `ORDER BY` and range filters.
    pub fn is_orderable(self) -> bool {
        !matches!(self, ColumnKind::Json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Entity attribute this column stores.
    pub field: String,
    pub kind: ColumnKind,
}

/// Table layout for one entity type.
///
/// Every table has an `id` text primary key and a `version` integer; both are
/// addressable as fields of the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    entity: String,
    table: String,
    id: Column,
    version: Column,
    columns: Vec<Column>,
}

impl TableSchema {
    pub const ID_COLUMN: &'static str = "id";
    pub const VERSION_COLUMN: &'static str = "version";

    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            id: Column {
                name: Self::ID_COLUMN.to_string(),
                field: Self::ID_COLUMN.to_string(),
                kind: ColumnKind::Text,
            },
            version: Column {
                name: Self::VERSION_COLUMN.to_string(),
                field: Self::VERSION_COLUMN.to_string(),
                kind: ColumnKind::Int,
            },
            columns: Vec::new(),
        }
    }

    /// Add a column storing `field`.
    pub fn column(mut self, name: impl Into<String>, field: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(Column {
            name: name.into(),
            field: field.into(),
            kind,
        });
        self
    }

    /// Entity name used in error messages.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Data columns, excluding `id` and `version`.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column storing `field`, including `id` and `version`.
    pub fn column_for_field(&self, field: &str) -> Option<&Column> {
        [&self.id, &self.version]
            .into_iter()
            .chain(self.columns.iter())
            .find(|c| c.field == field)
    }
}

/// Mapping failure for one record. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("missing column `{0}`")]
    MissingColumn(String),

    #[error("column `{column}`: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("column `{column}`: {message}")]
    InvalidValue { column: String, message: String },
}

impl MappingError {
    pub fn invalid(column: &str, message: impl ToString) -> Self {
        Self::InvalidValue {
            column: column.to_string(),
            message: message.to_string(),
        }
    }
}

/// Persisted view of one entity: identity, version and column values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub id: String,
    pub version: u64,
    pub values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Value of `column`; `id` and `version` are served from the header.
    ///
    /// A version beyond `i64::MAX` has no column value and reads as `None`.
    pub fn get(&self, column: &str) -> Option<Value> {
        match column {
            TableSchema::ID_COLUMN => Some(Value::Text(self.id.clone())),
            TableSchema::VERSION_COLUMN => i64::try_from(self.version).ok().map(Value::Int),
            _ => self.values.get(column).cloned(),
        }
    }

    fn required(&self, column: &str) -> Result<&Value, MappingError> {
        match self.values.get(column) {
            Some(Value::Null) | None => Err(MappingError::MissingColumn(column.to_string())),
            Some(v) => Ok(v),
        }
    }

    fn mismatch(column: &str, expected: &'static str, found: &Value) -> MappingError {
        MappingError::TypeMismatch {
            column: column.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn text(&self, column: &str) -> Result<String, MappingError> {
        match self.required(column)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(Self::mismatch(column, "text", other)),
        }
    }

    pub fn int(&self, column: &str) -> Result<i64, MappingError> {
        match self.required(column)? {
            Value::Int(i) => Ok(*i),
            other => Err(Self::mismatch(column, "int", other)),
        }
    }

    pub fn float(&self, column: &str) -> Result<f64, MappingError> {
        let value = self.required(column)?;
        value.as_f64().ok_or_else(|| Self::mismatch(column, "float", value))
    }

    pub fn bool(&self, column: &str) -> Result<bool, MappingError> {
        match self.required(column)? {
            Value::Bool(b) => Ok(*b),
            other => Err(Self::mismatch(column, "bool", other)),
        }
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, MappingError> {
        match self.required(column)? {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| MappingError::invalid(column, e)),
            other => Err(Self::mismatch(column, "timestamp", other)),
        }
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, MappingError> {
        match self.values.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.timestamp(column).map(Some),
        }
    }

    pub fn json(&self, column: &str) -> Result<JsonValue, MappingError> {
        match self.required(column)? {
            Value::Json(j) => Ok(j.clone()),
            Value::List(_) => Ok(self.values[column].to_json()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| MappingError::invalid(column, e)),
            other => Err(Self::mismatch(column, "json", other)),
        }
    }

    /// Decode a JSON column into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, column: &str) -> Result<T, MappingError> {
        serde_json::from_value(self.json(column)?).map_err(|e| MappingError::invalid(column, e))
    }
}

/// Converts between an aggregate and its persistence record.
pub trait EntityMapper: Send + Sync + 'static {
    type Entity: Persistable;

    fn schema(&self) -> &TableSchema;

    fn encode_id(&self, id: &<Self::Entity as Entity>::Id) -> String {
        id.to_string()
    }

    /// Record holding the entity's current state and version.
    fn to_model(&self, entity: &Self::Entity) -> Record;

    fn to_entity(&self, record: Record) -> Result<Self::Entity, MappingError>;
}
