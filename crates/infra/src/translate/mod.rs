//! Specification → native query translation.
//!
//! A [`SqlTranslator`] is bound to one dialect and one [`TableSchema`]. It turns
//! data-only specifications into a [`QueryFragment`] whose rows are exactly the
//! entities the in-memory evaluation accepts:
//!
//! - every leaf is wrapped in `COALESCE((...), FALSE)`, so SQL's unknown never
//!   leaks through `NOT` and a missing value never matches;
//! - comparisons the in-memory side would reject on type grounds compile to `FALSE`;
//! - anything without a faithful native form is refused with
//!   [`UntranslatableSpecification`] rather than approximated.
//!
//! [`SqlTranslator::plan`] is the fallback companion: it returns the tightest
//! translatable superset of a spec, which the repository narrows in memory.

mod sql;

use thiserror::Error;

use keystone_core::{Spec, Value};

use crate::mapper::TableSchema;

/// Supported SQL dialects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else {
            None
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
        }
    }
}

/// Why a specification has no native form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("untranslatable specification: {reason}")]
pub struct UntranslatableSpecification {
    pub reason: String,
}

impl UntranslatableSpecification {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Sql(String),
    Param(Value),
}

/// SQL text interleaved with typed parameters.
///
/// Placeholders are numbered only when rendering, so fragments can be nested
/// and concatenated freely.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryFragment {
    parts: Vec<Part>,
}

impl QueryFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sql(text: impl Into<String>) -> Self {
        let mut fragment = Self::new();
        fragment.push_sql(text);
        fragment
    }

    pub fn push_sql(&mut self, text: impl Into<String>) -> &mut Self {
        let text = text.into();
        match self.parts.last_mut() {
            Some(Part::Sql(prev)) => prev.push_str(&text),
            _ => self.parts.push(Part::Sql(text)),
        }
        self
    }

    pub fn push_param(&mut self, value: impl Into<Value>) -> &mut Self {
        self.parts.push(Part::Param(value.into()));
        self
    }

    pub fn append(&mut self, other: QueryFragment) -> &mut Self {
        for part in other.parts {
            match part {
                Part::Sql(text) => {
                    self.push_sql(text);
                }
                Part::Param(value) => {
                    self.push_param(value);
                }
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn params(&self) -> impl Iterator<Item = &Value> {
        self.parts.iter().filter_map(|p| match p {
            Part::Param(v) => Some(v),
            Part::Sql(_) => None,
        })
    }

    /// Render with placeholders numbered from 1.
    pub fn render(&self, dialect: Dialect) -> (String, Vec<Value>) {
        self.render_from(dialect, 1)
    }

    /// Render with placeholders numbered from `first`.
    pub fn render_from(&self, dialect: Dialect, first: usize) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        for part in &self.parts {
            match part {
                Part::Sql(text) => sql.push_str(text),
                Part::Param(value) => {
                    sql.push_str(&dialect.placeholder(first + params.len()));
                    params.push(value.clone());
                }
            }
        }
        (sql, params)
    }

    fn wrapped(prefix: &str, inner: QueryFragment, suffix: &str) -> Self {
        let mut out = Self::sql(prefix);
        out.append(inner);
        out.push_sql(suffix);
        out
    }

    fn binary(left: QueryFragment, op: &str, right: QueryFragment) -> Self {
        let mut out = Self::sql("(");
        out.append(left);
        out.push_sql(format!(" {op} "));
        out.append(right);
        out.push_sql(")");
        out
    }
}

/// Result of [`SqlTranslator::plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// Native filter; `None` means "every row".
    pub fragment: Option<QueryFragment>,
    /// Whether the fragment selects exactly the matching rows (otherwise a superset).
    pub exact: bool,
}

impl Translation {
    fn exact(fragment: QueryFragment) -> Self {
        Self {
            fragment: Some(fragment),
            exact: true,
        }
    }

    fn superset(fragment: Option<QueryFragment>) -> Self {
        Self {
            fragment,
            exact: false,
        }
    }
}

/// Compiles specifications for one dialect and one table.
#[derive(Debug, Clone, Copy)]
pub struct SqlTranslator<'a> {
    dialect: Dialect,
    schema: &'a TableSchema,
}

impl<'a> SqlTranslator<'a> {
    pub fn new(dialect: Dialect, schema: &'a TableSchema) -> Self {
        Self { dialect, schema }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Exact translation, or the reason there is none.
    pub fn translate<T: ?Sized>(
        &self,
        spec: &Spec<T>,
    ) -> Result<QueryFragment, UntranslatableSpecification> {
        match spec {
            Spec::Leaf(criterion) => {
                let leaf = sql::compile_leaf(self.dialect, self.schema, criterion)?;
                Ok(QueryFragment::wrapped("COALESCE((", leaf, "), FALSE)"))
            }
            Spec::Predicate(p) => Err(UntranslatableSpecification::new(format!(
                "predicate `{}` has no native form",
                p.name()
            ))),
            Spec::And(a, b) => Ok(QueryFragment::binary(self.translate(a)?, "AND", self.translate(b)?)),
            Spec::Or(a, b) => Ok(QueryFragment::binary(self.translate(a)?, "OR", self.translate(b)?)),
            Spec::Not(a) => Ok(QueryFragment::wrapped("(NOT ", self.translate(a)?, ")")),
        }
    }

    /// Tightest translatable superset of `spec`.
    ///
    /// `And` keeps whichever side translates; `Or` needs both sides; `Not`
    /// needs an exact child, since negating a superset is not a superset.
    pub fn plan<T: ?Sized>(&self, spec: &Spec<T>) -> Translation {
        match spec {
            Spec::Leaf(_) | Spec::Predicate(_) => match self.translate(spec) {
                Ok(fragment) => Translation::exact(fragment),
                Err(_) => Translation::superset(None),
            },
            Spec::And(a, b) => {
                let (a, b) = (self.plan(a), self.plan(b));
                let exact = a.exact && b.exact;
                let fragment = match (a.fragment, b.fragment) {
                    (Some(fa), Some(fb)) => Some(QueryFragment::binary(fa, "AND", fb)),
                    (Some(f), None) | (None, Some(f)) => Some(f),
                    (None, None) => None,
                };
                Translation { fragment, exact }
            }
            Spec::Or(a, b) => {
                let (a, b) = (self.plan(a), self.plan(b));
                match (a.fragment, b.fragment) {
                    (Some(fa), Some(fb)) => Translation {
                        fragment: Some(QueryFragment::binary(fa, "OR", fb)),
                        exact: a.exact && b.exact,
                    },
                    _ => Translation::superset(None),
                }
            }
            Spec::Not(inner) => {
                let planned = self.plan(inner);
                match planned.fragment {
                    Some(f) if planned.exact => {
                        Translation::exact(QueryFragment::wrapped("(NOT ", f, ")"))
                    }
                    _ => Translation::superset(None),
                }
            }
        }
    }
}

/// Double-quoted SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
