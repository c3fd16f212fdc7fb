//! Composable business-rule / query predicates ("specifications").
//!
//! A [`Spec`] is a pure predicate tree over one entity type: data-only leaves
//! ([`Criterion`]), a named closure escape hatch ([`PredicateSpec`]) and the
//! `And` / `Or` / `Not` composites. Composition never mutates its operands.
//!
//! The same tree is evaluated in memory through [`Specification::is_satisfied_by`]
//! and can be walked by store adapters to build native queries; keeping leaves
//! as plain data is what makes the second use possible.

mod criterion;

use core::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::value::{Attributes, Value};

pub use criterion::{Criterion, DateWindow, TextMatch};

/// The specification contract.
///
/// Implementations must be deterministic and free of hidden state.
pub trait Specification<T: ?Sized> {
    fn is_satisfied_by(&self, candidate: &T) -> bool;
}

/// Named closure leaf for logic no criterion can express.
///
/// Stores cannot look inside a closure, so specs containing one are evaluated
/// in memory (possibly after a narrower native pre-filter).
pub struct PredicateSpec<T: ?Sized> {
    name: String,
    func: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: ?Sized> PredicateSpec<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, candidate: &T) -> bool {
        (self.func)(candidate)
    }
}

impl<T: ?Sized> Clone for PredicateSpec<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<T: ?Sized> fmt::Debug for PredicateSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateSpec").field("name", &self.name).finish()
    }
}

/// Specification tree over `T`.
pub enum Spec<T: ?Sized> {
    Leaf(Criterion),
    Predicate(PredicateSpec<T>),
    And(Box<Spec<T>>, Box<Spec<T>>),
    Or(Box<Spec<T>>, Box<Spec<T>>),
    Not(Box<Spec<T>>),
}

impl<T: ?Sized> Clone for Spec<T> {
    fn clone(&self) -> Self {
        match self {
            Spec::Leaf(c) => Spec::Leaf(c.clone()),
            Spec::Predicate(p) => Spec::Predicate(p.clone()),
            Spec::And(a, b) => Spec::And(a.clone(), b.clone()),
            Spec::Or(a, b) => Spec::Or(a.clone(), b.clone()),
            Spec::Not(a) => Spec::Not(a.clone()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Spec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spec::Leaf(c) => f.debug_tuple("Leaf").field(c).finish(),
            Spec::Predicate(p) => f.debug_tuple("Predicate").field(p).finish(),
            Spec::And(a, b) => f.debug_tuple("And").field(a).field(b).finish(),
            Spec::Or(a, b) => f.debug_tuple("Or").field(a).field(b).finish(),
            Spec::Not(a) => f.debug_tuple("Not").field(a).finish(),
        }
    }
}

impl<T: Attributes + ?Sized> Specification<T> for Spec<T> {
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        match self {
            Spec::Leaf(criterion) => criterion.evaluate(candidate),
            Spec::Predicate(p) => p.test(candidate),
            Spec::And(a, b) => a.is_satisfied_by(candidate) && b.is_satisfied_by(candidate),
            Spec::Or(a, b) => a.is_satisfied_by(candidate) || b.is_satisfied_by(candidate),
            Spec::Not(a) => !a.is_satisfied_by(candidate),
        }
    }
}

impl<T: ?Sized> Spec<T> {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Spec::Leaf(Criterion::Equals {
            field: field.into(),
            value: value.into(),
        })
    }

    /// Inclusive range `min <= field <= max`.
    pub fn range(field: impl Into<String>, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Spec::Leaf(Criterion::Range {
            field: field.into(),
            min: Some(min.into()),
            max: Some(max.into()),
        })
    }

    pub fn at_least(field: impl Into<String>, min: impl Into<Value>) -> Self {
        Spec::Leaf(Criterion::Range {
            field: field.into(),
            min: Some(min.into()),
            max: None,
        })
    }

    pub fn at_most(field: impl Into<String>, max: impl Into<Value>) -> Self {
        Spec::Leaf(Criterion::Range {
            field: field.into(),
            min: None,
            max: Some(max.into()),
        })
    }

    /// Text match. Fails only for an invalid regular expression.
    pub fn text(
        field: impl Into<String>,
        pattern: impl Into<String>,
        mode: TextMatch,
        case_sensitive: bool,
    ) -> DomainResult<Self> {
        let pattern = pattern.into();
        let compiled = match mode {
            TextMatch::Regex => Some(
                criterion::build_regex(&pattern, case_sensitive)
                    .map_err(|e| DomainError::validation(format!("invalid regex: {e}")))?,
            ),
            _ => None,
        };
        Ok(Spec::Leaf(Criterion::Text {
            field: field.into(),
            pattern,
            mode,
            case_sensitive,
            compiled,
        }))
    }

    /// Case-sensitive substring match.
    pub fn contains(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Spec::Leaf(Criterion::Text {
            field: field.into(),
            pattern: pattern.into(),
            mode: TextMatch::Contains,
            case_sensitive: true,
            compiled: None,
        })
    }

    pub fn one_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Spec::Leaf(Criterion::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn none_of<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Spec::Leaf(Criterion::NotIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn size_between(field: impl Into<String>, min: Option<usize>, max: Option<usize>) -> Self {
        Spec::Leaf(Criterion::CollectionSize {
            field: field.into(),
            min,
            max,
        })
    }

    pub fn has_element(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Spec::Leaf(Criterion::CollectionContains {
            field: field.into(),
            value: value.into(),
        })
    }

    /// Relative date window anchored at the current time.
    ///
    /// The anchor is captured here, once; evaluating it later does not
    /// consult the clock again.
    pub fn within_days(field: impl Into<String>, days: u32, window: DateWindow) -> Self {
        Self::within_days_of(field, days, window, Utc::now())
    }

    pub fn within_days_of(
        field: impl Into<String>,
        days: u32,
        window: DateWindow,
        anchor: DateTime<Utc>,
    ) -> Self {
        Spec::Leaf(Criterion::WithinDays {
            field: field.into(),
            days,
            window,
            anchor,
        })
    }

    pub fn json_path<S: Into<String>>(
        field: impl Into<String>,
        path: impl IntoIterator<Item = S>,
        value: JsonValue,
    ) -> Self {
        Spec::Leaf(Criterion::JsonPath {
            field: field.into(),
            path: path.into_iter().map(Into::into).collect(),
            value,
        })
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Spec::Leaf(Criterion::IsNull {
            field: field.into(),
        })
    }

    pub fn predicate(
        name: impl Into<String>,
        func: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Spec::Predicate(PredicateSpec {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    /// Lift any [`Specification`] implementation into the tree (as a predicate).
    pub fn from_specification<S>(name: impl Into<String>, spec: S) -> Self
    where
        S: Specification<T> + Send + Sync + 'static,
    {
        Self::predicate(name, move |candidate: &T| spec.is_satisfied_by(candidate))
    }

    pub fn and_(&self, other: &Spec<T>) -> Spec<T> {
        Spec::And(Box::new(self.clone()), Box::new(other.clone()))
    }

    pub fn or_(&self, other: &Spec<T>) -> Spec<T> {
        Spec::Or(Box::new(self.clone()), Box::new(other.clone()))
    }

    pub fn not_(&self) -> Spec<T> {
        Spec::Not(Box::new(self.clone()))
    }

    /// Left-fold with `And`. `None` for an empty input.
    pub fn all(specs: impl IntoIterator<Item = Spec<T>>) -> Option<Spec<T>> {
        specs
            .into_iter()
            .reduce(|acc, next| Spec::And(Box::new(acc), Box::new(next)))
    }

    /// Left-fold with `Or`. `None` for an empty input.
    pub fn any(specs: impl IntoIterator<Item = Spec<T>>) -> Option<Spec<T>> {
        specs
            .into_iter()
            .reduce(|acc, next| Spec::Or(Box::new(acc), Box::new(next)))
    }

    /// True when the tree contains no predicate leaf.
    pub fn is_data_only(&self) -> bool {
        match self {
            Spec::Leaf(_) => true,
            Spec::Predicate(_) => false,
            Spec::And(a, b) | Spec::Or(a, b) => a.is_data_only() && b.is_data_only(),
            Spec::Not(a) => a.is_data_only(),
        }
    }
}

impl<T: ?Sized> core::ops::BitAnd for Spec<T> {
    type Output = Spec<T>;

    fn bitand(self, rhs: Self) -> Self::Output {
        Spec::And(Box::new(self), Box::new(rhs))
    }
}

impl<T: ?Sized> core::ops::BitOr for Spec<T> {
    type Output = Spec<T>;

    fn bitor(self, rhs: Self) -> Self::Output {
        Spec::Or(Box::new(self), Box::new(rhs))
    }
}

impl<T: ?Sized> core::ops::Not for Spec<T> {
    type Output = Spec<T>;

    fn not(self) -> Self::Output {
        Spec::Not(Box::new(self))
    }
}

impl<T: ?Sized> fmt::Display for Spec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spec::Leaf(c) => write!(f, "{}", describe(c)),
            Spec::Predicate(p) => write!(f, "predicate({})", p.name()),
            Spec::And(a, b) => write!(f, "({a} AND {b})"),
            Spec::Or(a, b) => write!(f, "({a} OR {b})"),
            Spec::Not(a) => write!(f, "NOT {a}"),
        }
    }
}

fn describe(c: &Criterion) -> String {
    match c {
        Criterion::Equals { field, value } => format!("{field} = {value:?}"),
        Criterion::Range { field, min, max } => format!("{field} in [{min:?}, {max:?}]"),
        Criterion::Text {
            field,
            pattern,
            mode,
            case_sensitive,
            ..
        } => format!("{field} {mode:?}{} {pattern:?}", if *case_sensitive { "" } else { "(ci)" }),
        Criterion::In { field, values } => format!("{field} in {values:?}"),
        Criterion::NotIn { field, values } => format!("{field} not in {values:?}"),
        Criterion::CollectionSize { field, min, max } => {
            format!("len({field}) in [{min:?}, {max:?}]")
        }
        Criterion::CollectionContains { field, value } => format!("{field} contains {value:?}"),
        Criterion::WithinDays {
            field,
            days,
            window,
            anchor,
        } => format!("{field} within {days}d {window:?} of {anchor}"),
        Criterion::JsonPath { field, path, value } => {
            format!("{field}.{} = {value}", path.join("."))
        }
        Criterion::IsNull { field } => format!("{field} is null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default)]
    struct Item {
        fields: HashMap<&'static str, Value>,
    }

    impl Item {
        fn with(mut self, field: &'static str, value: impl Into<Value>) -> Self {
            self.fields.insert(field, value.into());
            self
        }
    }

    impl Attributes for Item {
        fn attribute(&self, field: &str) -> Option<Value> {
            self.fields.get(field).cloned()
        }
    }

    fn item(sku: &str, price: i64, in_stock: bool) -> Item {
        Item::default()
            .with("sku", sku)
            .with("price", price)
            .with("in_stock", in_stock)
    }

    #[test]
    fn range_is_inclusive_on_both_bounds() {
        let spec = Spec::<Item>::range("price", 100, 200);
        assert!(spec.is_satisfied_by(&item("A", 100, true)));
        assert!(spec.is_satisfied_by(&item("A", 200, true)));
        assert!(!spec.is_satisfied_by(&item("A", 99, true)));
        assert!(!spec.is_satisfied_by(&item("A", 201, true)));
    }

    #[test]
    fn case_insensitive_contains() {
        let spec = Spec::<Item>::text("sku", "a", TextMatch::Contains, false).unwrap();
        assert!(spec.is_satisfied_by(&item("A", 50, true)));
        assert!(!spec.is_satisfied_by(&item("B", 150, false)));
    }

    #[test]
    fn text_modes() {
        let candidate = item("Widget-42", 1, true);
        let check = |mode, pattern: &str, cs| {
            Spec::<Item>::text("sku", pattern, mode, cs)
                .unwrap()
                .is_satisfied_by(&candidate)
        };
        assert!(check(TextMatch::StartsWith, "Widget", true));
        assert!(!check(TextMatch::StartsWith, "widget", true));
        assert!(check(TextMatch::StartsWith, "widget", false));
        assert!(check(TextMatch::EndsWith, "-42", true));
        assert!(check(TextMatch::Exact, "WIDGET-42", false));
        assert!(!check(TextMatch::Exact, "Widget", true));
        assert!(check(TextMatch::Regex, r"^w\w+-\d+$", false));
        assert!(!check(TextMatch::Regex, r"^w\w+-\d+$", true));
    }

    #[test]
    fn invalid_regex_is_a_validation_error() {
        let err = Spec::<Item>::text("sku", "(", TextMatch::Regex, true).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn missing_attributes_do_not_match_unless_is_null() {
        let candidate = Item::default().with("sku", "A");
        assert!(!Spec::<Item>::eq("price", 1).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::none_of("price", [1]).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::at_least("price", 0).is_satisfied_by(&candidate));
        assert!(Spec::<Item>::is_null("price").is_satisfied_by(&candidate));
        assert!(Spec::<Item>::is_null("gone").is_satisfied_by(&candidate.clone().with("gone", Value::Null)));
    }

    #[test]
    fn membership_and_negation() {
        let candidate = item("B", 1, true);
        assert!(Spec::<Item>::one_of("sku", ["A", "B"]).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::none_of("sku", ["A", "B"]).is_satisfied_by(&candidate));
        assert!(Spec::<Item>::none_of("sku", ["C"]).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::one_of("sku", Vec::<&str>::new()).is_satisfied_by(&candidate));
    }

    #[test]
    fn collections() {
        let candidate = Item::default().with("tags", vec!["red", "sale"]);
        assert!(Spec::<Item>::has_element("tags", "sale").is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::has_element("tags", "blue").is_satisfied_by(&candidate));
        assert!(Spec::<Item>::size_between("tags", Some(2), Some(2)).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::size_between("tags", Some(3), None).is_satisfied_by(&candidate));
    }

    #[test]
    fn relative_dates_use_the_captured_anchor() {
        let anchor = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let past = Spec::<Item>::within_days_of("created_at", 7, DateWindow::Past, anchor);
        let future = Spec::<Item>::within_days_of("created_at", 7, DateWindow::Future, anchor);
        let three_days_ago = Item::default().with("created_at", anchor - chrono::Duration::days(3));
        let edge = Item::default().with("created_at", anchor - chrono::Duration::days(7));
        assert!(past.is_satisfied_by(&three_days_ago));
        assert!(past.is_satisfied_by(&edge));
        assert!(!future.is_satisfied_by(&three_days_ago));
    }

    #[test]
    fn json_path_equality() {
        let candidate = Item::default().with("attrs", json!({"dims": {"w": 10, "unit": "cm"}}));
        assert!(Spec::<Item>::json_path("attrs", ["dims", "w"], json!(10.0)).is_satisfied_by(&candidate));
        assert!(Spec::<Item>::json_path("attrs", ["dims", "unit"], json!("cm")).is_satisfied_by(&candidate));
        assert!(!Spec::<Item>::json_path("attrs", ["dims", "h"], json!(10)).is_satisfied_by(&candidate));
    }

    #[test]
    fn composition_does_not_mutate_operands() {
        let cheap = Spec::<Item>::at_most("price", 100);
        let stocked = Spec::<Item>::eq("in_stock", true);
        let both = cheap.and_(&stocked);
        let candidate = item("A", 50, false);
        assert!(cheap.is_satisfied_by(&candidate));
        assert!(!both.is_satisfied_by(&candidate));
        assert_eq!(both.to_string(), format!("({cheap} AND {stocked})"));
    }

    #[test]
    fn and_short_circuits_on_first_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let counted = Spec::<Item>::predicate("counted", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let spec = Spec::eq("sku", "nope") & counted.clone();
        assert!(!spec.is_satisfied_by(&item("A", 1, true)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let spec = Spec::eq("sku", "A") | counted;
        assert!(spec.is_satisfied_by(&item("A", 1, true)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn all_and_any_fold() {
        assert!(Spec::<Item>::all(Vec::new()).is_none());
        let spec = Spec::all([Spec::<Item>::eq("sku", "A"), Spec::eq("in_stock", true)]).unwrap();
        assert!(spec.is_satisfied_by(&item("A", 1, true)));
        assert!(!spec.is_satisfied_by(&item("A", 1, false)));
        assert!(spec.is_data_only());
    }

    fn arb_item() -> impl Strategy<Value = Item> {
        (
            prop_oneof![Just(None), "[a-c]{1,2}".prop_map(Some)],
            prop_oneof![Just(None), (0i64..300).prop_map(Some)],
            any::<bool>(),
        )
            .prop_map(|(sku, price, in_stock)| {
                let mut item = Item::default().with("in_stock", in_stock);
                if let Some(sku) = sku {
                    item = item.with("sku", sku);
                }
                if let Some(price) = price {
                    item = item.with("price", price);
                }
                item
            })
    }

    fn arb_spec() -> impl Strategy<Value = Spec<Item>> {
        let leaf = prop_oneof![
            "[a-c]{1,2}".prop_map(|s| Spec::eq("sku", s)),
            (0i64..300, 0i64..300).prop_map(|(a, b)| Spec::range("price", a.min(b), a.max(b))),
            any::<bool>().prop_map(|b| Spec::eq("in_stock", b)),
            "[a-c]".prop_map(|s| Spec::contains("sku", s)),
            Just(Spec::is_null("price")),
            (0i64..300).prop_map(|n| Spec::predicate("even", move |i: &Item| {
                i.attribute("price").and_then(|v| v.as_f64()).is_some_and(|p| (p as i64 + n) % 2 == 0)
            })),
        ];
        leaf.prop_recursive(3, 16, 2, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| a & b),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| a | b),
                inner.prop_map(|a| !a),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: composites agree with boolean operators on their children.
        #[test]
        fn boolean_algebra_laws(a in arb_spec(), b in arb_spec(), x in arb_item()) {
            let (ea, eb) = (a.is_satisfied_by(&x), b.is_satisfied_by(&x));
            prop_assert_eq!(a.and_(&b).is_satisfied_by(&x), ea && eb);
            prop_assert_eq!(a.or_(&b).is_satisfied_by(&x), ea || eb);
            prop_assert_eq!(a.not_().is_satisfied_by(&x), !ea);
            prop_assert_eq!(a.not_().not_().is_satisfied_by(&x), ea);
            prop_assert_eq!(
                a.and_(&b).not_().is_satisfied_by(&x),
                a.not_().or_(&b.not_()).is_satisfied_by(&x)
            );
            prop_assert_eq!(
                a.or_(&b).not_().is_satisfied_by(&x),
                a.not_().and_(&b.not_()).is_satisfied_by(&x)
            );
        }

        /// Property: evaluation is deterministic.
        #[test]
        fn evaluation_is_deterministic(a in arb_spec(), x in arb_item()) {
            prop_assert_eq!(a.is_satisfied_by(&x), a.clone().is_satisfied_by(&x));
        }
    }
}
