//! Data-only leaf criteria.
//!
//! A criterion names an attribute and a comparison. Because it carries no code,
//! a store adapter can inspect it and compile it into a native query; the same
//! criterion evaluates in memory through [`Criterion::evaluate`].

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::value::{json_eq, Attributes, Value};

/// Text comparison mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextMatch {
    Contains,
    StartsWith,
    EndsWith,
    Exact,
    Regex,
}

/// Which side of the anchor a relative date window covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DateWindow {
    /// `[anchor - days, anchor]`
    Past,
    /// `[anchor, anchor + days]`
    Future,
    /// `[anchor - days, anchor + days]`
    Around,
}

impl DateWindow {
    /// Inclusive bounds of the window.
    pub fn bounds(self, anchor: DateTime<Utc>, days: u32) -> (DateTime<Utc>, DateTime<Utc>) {
        let span = Duration::days(i64::from(days));
        match self {
            DateWindow::Past => (anchor - span, anchor),
            DateWindow::Future => (anchor, anchor + span),
            DateWindow::Around => (anchor - span, anchor + span),
        }
    }
}

/// A leaf predicate over one attribute.
#[derive(Debug, Clone)]
pub enum Criterion {
    /// Attribute equals `value`.
    Equals { field: String, value: Value },

    /// `min <= attribute <= max`; both bounds inclusive, either may be open.
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
    },

    /// Text comparison. `compiled` holds the regex for [`TextMatch::Regex`].
    Text {
        field: String,
        pattern: String,
        mode: TextMatch,
        case_sensitive: bool,
        compiled: Option<Regex>,
    },

    /// Attribute equals one of `values`.
    In { field: String, values: Vec<Value> },

    /// Attribute is present and equals none of `values`.
    NotIn { field: String, values: Vec<Value> },

    /// Collection length within `[min, max]`.
    CollectionSize {
        field: String,
        min: Option<usize>,
        max: Option<usize>,
    },

    /// Collection has an element equal to `value`.
    CollectionContains { field: String, value: Value },

    /// Timestamp attribute falls in a window of `days` around a fixed anchor.
    WithinDays {
        field: String,
        days: u32,
        window: DateWindow,
        anchor: DateTime<Utc>,
    },

    /// The JSON value found by walking `path` (object keys) equals `value`.
    JsonPath {
        field: String,
        path: Vec<String>,
        value: JsonValue,
    },

    /// Attribute is missing or null.
    IsNull { field: String },
}

impl Criterion {
    pub fn field(&self) -> &str {
        match self {
            Criterion::Equals { field, .. }
            | Criterion::Range { field, .. }
            | Criterion::Text { field, .. }
            | Criterion::In { field, .. }
            | Criterion::NotIn { field, .. }
            | Criterion::CollectionSize { field, .. }
            | Criterion::CollectionContains { field, .. }
            | Criterion::WithinDays { field, .. }
            | Criterion::JsonPath { field, .. }
            | Criterion::IsNull { field } => field,
        }
    }

    /// Evaluate against a candidate. Never panics.
    pub fn evaluate<A: Attributes + ?Sized>(&self, candidate: &A) -> bool {
        let attr = candidate.attribute(self.field());

        if let Criterion::IsNull { .. } = self {
            return attr.as_ref().is_none_or(Value::is_null);
        }

        let value = match attr {
            Some(v) if !v.is_null() => v,
            _ => return false,
        };

        match self {
            Criterion::Equals { value: expected, .. } => value.matches(expected),
            Criterion::Range { min, max, .. } => in_range(&value, min.as_ref(), max.as_ref()),
            Criterion::Text {
                pattern,
                mode,
                case_sensitive,
                compiled,
                ..
            } => match value.as_str() {
                Some(text) => text_matches(text, pattern, *mode, *case_sensitive, compiled.as_ref()),
                None => false,
            },
            Criterion::In { values, .. } => values.iter().any(|v| value.matches(v)),
            Criterion::NotIn { values, .. } => !values.iter().any(|v| value.matches(v)),
            Criterion::CollectionSize { min, max, .. } => match collection_len(&value) {
                Some(len) => min.is_none_or(|m| len >= m) && max.is_none_or(|m| len <= m),
                None => false,
            },
            Criterion::CollectionContains { value: needle, .. } => match &value {
                Value::List(items) => items.iter().any(|item| item.matches(needle)),
                Value::Json(JsonValue::Array(items)) => {
                    !needle.is_null() && items.iter().any(|item| json_eq(item, &needle.to_json()))
                }
                _ => false,
            },
            Criterion::WithinDays {
                days,
                window,
                anchor,
                ..
            } => match value {
                Value::Timestamp(ts) => {
                    let (from, to) = window.bounds(*anchor, *days);
                    from <= ts && ts <= to
                }
                _ => false,
            },
            Criterion::JsonPath {
                path,
                value: expected,
                ..
            } => match &value {
                Value::Json(doc) => walk(doc, path).is_some_and(|found| json_eq(found, expected)),
                _ => false,
            },
            Criterion::IsNull { .. } => unreachable!("handled above"),
        }
    }
}

fn in_range(value: &Value, min: Option<&Value>, max: Option<&Value>) -> bool {
    use core::cmp::Ordering::*;

    let lower_ok = match min {
        Some(m) => matches!(value.compare(m), Some(Greater | Equal)),
        None => true,
    };
    let upper_ok = match max {
        Some(m) => matches!(value.compare(m), Some(Less | Equal)),
        None => true,
    };
    // A fully open range still requires an orderable value.
    lower_ok && upper_ok && value.compare(value).is_some()
}

fn text_matches(
    text: &str,
    pattern: &str,
    mode: TextMatch,
    case_sensitive: bool,
    compiled: Option<&Regex>,
) -> bool {
    if mode == TextMatch::Regex {
        return match compiled {
            Some(re) => re.is_match(text),
            None => build_regex(pattern, case_sensitive).is_ok_and(|re| re.is_match(text)),
        };
    }

    let (text, pattern) = if case_sensitive {
        (text.to_string(), pattern.to_string())
    } else {
        (text.to_lowercase(), pattern.to_lowercase())
    };

    match mode {
        TextMatch::Contains => text.contains(&pattern),
        TextMatch::StartsWith => text.starts_with(&pattern),
        TextMatch::EndsWith => text.ends_with(&pattern),
        TextMatch::Exact => text == pattern,
        TextMatch::Regex => unreachable!("handled above"),
    }
}

pub(crate) fn build_regex(pattern: &str, case_sensitive: bool) -> Result<Regex, regex::Error> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
}

fn collection_len(value: &Value) -> Option<usize> {
    match value {
        Value::List(items) => Some(items.len()),
        Value::Json(JsonValue::Array(items)) => Some(items.len()),
        _ => None,
    }
}

fn walk<'a>(doc: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    path.iter()
        .try_fold(doc, |node, key| node.as_object().and_then(|obj| obj.get(key)))
}
