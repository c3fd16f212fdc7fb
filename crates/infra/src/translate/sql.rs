//! Leaf compilation.
//!
//! Column values are stored the way the mappers write them: timestamps as
//! canonical RFC 3339 text, lists and documents as JSON text. Each leaf below
//! reproduces `Criterion::evaluate` over that representation.

use serde_json::Value as JsonValue;

use keystone_core::value::canonical_timestamp;
use keystone_core::{Criterion, TextMatch, Value};

use super::{Dialect, QueryFragment, UntranslatableSpecification, quote_ident};
use crate::mapper::{Column, ColumnKind, TableSchema};

type LeafResult = Result<QueryFragment, UntranslatableSpecification>;

pub(super) fn compile_leaf(dialect: Dialect, schema: &TableSchema, criterion: &Criterion) -> LeafResult {
    let field = criterion.field();
    let column = schema.column_for_field(field).ok_or_else(|| {
        UntranslatableSpecification::new(format!(
            "field `{field}` is not mapped to a column of `{}`",
            schema.table()
        ))
    })?;
    let leaf = Leaf {
        dialect,
        column,
        col: quote_ident(&column.name),
        qualified: format!("{}.{}", quote_ident(schema.table()), quote_ident(&column.name)),
    };

    match criterion {
        Criterion::Equals { value, .. } => leaf.equals(value),
        Criterion::Range { min, max, .. } => Ok(leaf.range(min.as_ref(), max.as_ref())),
        Criterion::Text {
            pattern,
            mode,
            case_sensitive,
            ..
        } => leaf.text(pattern, *mode, *case_sensitive),
        Criterion::In { values, .. } => leaf.membership(values, false),
        Criterion::NotIn { values, .. } => leaf.membership(values, true),
        Criterion::CollectionSize { min, max, .. } => Ok(leaf.collection_size(*min, *max)),
        Criterion::CollectionContains { value, .. } => leaf.collection_contains(value),
        Criterion::WithinDays {
            days,
            window,
            anchor,
            ..
        } => {
            let (from, to) = window.bounds(*anchor, *days);
            Ok(leaf.range(Some(&Value::Timestamp(from)), Some(&Value::Timestamp(to))))
        }
        Criterion::JsonPath { path, value, .. } => leaf.json_path(path, value),
        Criterion::IsNull { .. } => Ok(QueryFragment::sql(format!("{} IS NULL", leaf.col))),
    }
}

fn never() -> QueryFragment {
    QueryFragment::sql("FALSE")
}

struct Leaf<'a> {
    dialect: Dialect,
    column: &'a Column,
    col: String,
    /// Table-qualified column, for correlated subqueries.
    qualified: String,
}

impl Leaf<'_> {
    fn untranslatable(&self, what: &str) -> UntranslatableSpecification {
        UntranslatableSpecification::new(format!(
            "{what} on column `{}` ({:?}) in {:?}",
            self.column.name, self.column.kind, self.dialect
        ))
    }

    /// Parameter value comparable with this scalar column, or `None` when the
    /// in-memory comparison could never succeed.
    fn scalar_param(&self, value: &Value) -> Option<Value> {
        match (self.column.kind, value) {
            (ColumnKind::Bool, Value::Bool(_))
            | (ColumnKind::Int | ColumnKind::Float, Value::Int(_) | Value::Float(_))
            | (ColumnKind::Text, Value::Text(_)) => Some(value.clone()),
            (ColumnKind::Timestamp, Value::Timestamp(ts)) => Some(Value::Text(canonical_timestamp(ts))),
            _ => None,
        }
    }

    /// Column expression for ordered comparisons; Postgres text compares byte-wise under "C".
    fn ordered_col(&self) -> String {
        match (self.dialect, self.column.kind) {
            (Dialect::Postgres, ColumnKind::Text | ColumnKind::Timestamp) => {
                format!("{} COLLATE \"C\"", self.col)
            }
            _ => self.col.clone(),
        }
    }

    fn equals(&self, value: &Value) -> LeafResult {
        if self.column.kind == ColumnKind::Json {
            return Err(self.untranslatable("equality"));
        }
        Ok(match self.scalar_param(value) {
            Some(param) => {
                let mut f = QueryFragment::sql(format!("{} = ", self.col));
                f.push_param(param);
                f
            }
            None => never(),
        })
    }

    fn range(&self, min: Option<&Value>, max: Option<&Value>) -> QueryFragment {
        if !self.column.kind.is_orderable() {
            return never();
        }
        let col = self.ordered_col();
        let mut f = QueryFragment::new();
        for (bound, op) in [(min, ">="), (max, "<=")] {
            let Some(bound) = bound else { continue };
            let Some(param) = self.scalar_param(bound) else {
                return never();
            };
            if !f.is_empty() {
                f.push_sql(" AND ");
            }
            f.push_sql(format!("{col} {op} "));
            f.push_param(param);
        }
        if f.is_empty() {
            f.push_sql(format!("{} IS NOT NULL", self.col));
        }
        f
    }

    fn text(&self, pattern: &str, mode: TextMatch, case_sensitive: bool) -> LeafResult {
        if self.column.kind != ColumnKind::Text {
            return Ok(never());
        }
        if pattern.is_empty() && matches!(mode, TextMatch::Contains | TextMatch::StartsWith | TextMatch::EndsWith) {
            return Ok(QueryFragment::sql(format!("{} IS NOT NULL", self.col)));
        }

        let fold = |expr: &str| {
            if case_sensitive {
                expr.to_string()
            } else {
                format!("lower({expr})")
            }
        };
        let col = fold(&self.col);
        let p = fold("{p}");
        let pattern = Value::from(pattern);

        // `{p}` marks each occurrence of the pattern parameter.
        let template = match (self.dialect, mode) {
            (Dialect::Postgres, TextMatch::Regex) => {
                let op = if case_sensitive { "~" } else { "~*" };
                format!("{} {op} {{p}}", self.col)
            }
            (Dialect::Sqlite, TextMatch::Regex) => {
                return Err(self.untranslatable("regular expression"));
            }
            (_, TextMatch::Exact) => format!("{col} = {p}"),
            (Dialect::Postgres, TextMatch::Contains) => format!("strpos({col}, {p}) > 0"),
            (Dialect::Sqlite, TextMatch::Contains) => format!("instr({col}, {p}) > 0"),
            (Dialect::Postgres, TextMatch::StartsWith) => format!("left({col}, length({p})) = {p}"),
            (Dialect::Sqlite, TextMatch::StartsWith) => format!("substr({col}, 1, length({p})) = {p}"),
            (Dialect::Postgres, TextMatch::EndsWith) => format!("right({col}, length({p})) = {p}"),
            (Dialect::Sqlite, TextMatch::EndsWith) => {
                format!("length({col}) >= length({p}) AND substr({col}, -length({p})) = {p}")
            }
        };

        let mut f = QueryFragment::new();
        let mut pieces = template.split("{p}").peekable();
        while let Some(piece) = pieces.next() {
            f.push_sql(piece);
            if pieces.peek().is_some() {
                f.push_param(pattern.clone());
            }
        }
        Ok(f)
    }

    fn membership(&self, values: &[Value], negated: bool) -> LeafResult {
        if self.column.kind == ColumnKind::Json {
            return Err(self.untranslatable("membership"));
        }
        let params: Vec<Value> = values.iter().filter_map(|v| self.scalar_param(v)).collect();
        if params.is_empty() {
            return Ok(if negated {
                QueryFragment::sql(format!("{} IS NOT NULL", self.col))
            } else {
                never()
            });
        }

        let op = if negated { "NOT IN" } else { "IN" };
        let mut f = QueryFragment::sql(format!("{} {op} (", self.col));
        for (i, param) in params.into_iter().enumerate() {
            if i > 0 {
                f.push_sql(", ");
            }
            f.push_param(param);
        }
        f.push_sql(")");
        Ok(f)
    }

    /// Length of the JSON array in this column, NULL for anything else.
    fn array_length(&self) -> String {
        match self.dialect {
            Dialect::Postgres => format!(
                "(CASE WHEN jsonb_typeof({c}::jsonb) = 'array' THEN jsonb_array_length({c}::jsonb) END)",
                c = self.col
            ),
            Dialect::Sqlite => format!(
                "(CASE WHEN json_type({c}) = 'array' THEN json_array_length({c}) END)",
                c = self.col
            ),
        }
    }

    fn collection_size(&self, min: Option<usize>, max: Option<usize>) -> QueryFragment {
        if self.column.kind != ColumnKind::Json {
            return never();
        }
        let len = self.array_length();
        let mut f = QueryFragment::sql(format!("{len} IS NOT NULL"));
        for (bound, op) in [(min, ">="), (max, "<=")] {
            if let Some(bound) = bound {
                f.push_sql(format!(" AND {len} {op} "));
                f.push_param(Value::Int(i64::try_from(bound).unwrap_or(i64::MAX)));
            }
        }
        f
    }

    fn collection_contains(&self, needle: &Value) -> LeafResult {
        if self.column.kind != ColumnKind::Json {
            return Ok(never());
        }
        match needle {
            Value::Null => return Ok(never()),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Text(_) => {}
            _ => return Err(self.untranslatable(&format!("contains with a {} element", needle.kind()))),
        }

        let mut f = QueryFragment::new();
        match self.dialect {
            Dialect::Postgres => {
                f.push_sql(format!(
                    "jsonb_typeof({c}::jsonb) = 'array' AND {c}::jsonb @> CAST(",
                    c = self.col
                ));
                f.push_param(Value::Text(JsonValue::Array(vec![needle.to_json()]).to_string()));
                f.push_sql(" AS jsonb)");
            }
            Dialect::Sqlite => {
                let types = match needle {
                    Value::Bool(true) => "'true'",
                    Value::Bool(false) => "'false'",
                    Value::Text(_) => "'text'",
                    _ => "'integer', 'real'",
                };
                f.push_sql(format!(
                    "json_type({q}) = 'array' AND EXISTS (SELECT 1 FROM json_each({q}) AS je WHERE je.type IN ({types})",
                    q = self.qualified
                ));
                if !matches!(needle, Value::Bool(_)) {
                    f.push_sql(" AND je.value = ");
                    f.push_param(needle.clone());
                }
                f.push_sql(")");
            }
        }
        Ok(f)
    }

    fn json_path(&self, path: &[String], expected: &JsonValue) -> LeafResult {
        if self.column.kind != ColumnKind::Json {
            return Ok(never());
        }
        if path.iter().any(|k| k.contains('"') || k.contains('\\')) {
            return Err(self.untranslatable("JSON path with quoted keys"));
        }

        let mut f = QueryFragment::new();
        match self.dialect {
            Dialect::Postgres => {
                // `#>` treats numeric keys as array indexes; object-only walks cannot.
                if path.iter().any(|k| k.parse::<i64>().is_ok()) {
                    return Err(self.untranslatable("JSON path with numeric keys"));
                }
                f.push_sql(format!("({}::jsonb #> ARRAY[", self.col));
                for (i, key) in path.iter().enumerate() {
                    if i > 0 {
                        f.push_sql(", ");
                    }
                    f.push_param(Value::Text(key.clone()));
                }
                f.push_sql("]::text[]) = CAST(");
                f.push_param(Value::Text(expected.to_string()));
                f.push_sql(" AS jsonb)");
            }
            Dialect::Sqlite => {
                let json_path: String = std::iter::once("$".to_string())
                    .chain(path.iter().map(|k| format!(".\"{k}\"")))
                    .collect();
                let json_path = Value::Text(json_path);
                let type_is = |f: &mut QueryFragment, types: &str| {
                    f.push_sql(format!("json_type({}, ", self.col));
                    f.push_param(json_path.clone());
                    f.push_sql(format!(") IN ({types})"));
                };
                match expected {
                    JsonValue::Null => type_is(&mut f, "'null'"),
                    JsonValue::Bool(true) => type_is(&mut f, "'true'"),
                    JsonValue::Bool(false) => type_is(&mut f, "'false'"),
                    JsonValue::Number(_) | JsonValue::String(_) => {
                        let types = if expected.is_string() { "'text'" } else { "'integer', 'real'" };
                        type_is(&mut f, types);
                        f.push_sql(format!(" AND json_extract({}, ", self.col));
                        f.push_param(json_path.clone());
                        f.push_sql(") = ");
                        f.push_param(Value::from_json(expected));
                    }
                    JsonValue::Array(_) | JsonValue::Object(_) => {
                        return Err(self.untranslatable("JSON path comparison with a non-scalar value"));
                    }
                }
            }
        }
        Ok(f)
    }
}
