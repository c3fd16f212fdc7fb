//! Differential check: every store selects, counts and pages exactly the
//! entities the in-memory evaluation selects.
//!
//! SQLite runs translated specifications, and falls back to in-memory
//! filtering for the parts it cannot translate. The in-memory store always
//! filters with `is_satisfied_by`.
//!
//! Generated text is ASCII only; SQLite's `lower()` does not fold anything else.

mod common;

use std::cmp::Ordering;

use chrono::Duration;
use keystone_core::{Attributes, DateWindow, Spec, Specification, TextMatch, Value};
use keystone_events::EventPublisher;
use keystone_infra::{
    Dialect, EntityMapper, ListQuery, ProductMapper, Repository, RepositoryError, SortDirection,
    SqlTranslator, Store, UnitOfWorkFactory,
};
use keystone_products::Product;
use proptest::prelude::*;
use serde_json::json;

use common::{memory_factory, product, sqlite_factory, t0};

/// Integers just above 2^53, where `f64` can no longer tell neighbours apart.
const BIG: i64 = 9_007_199_254_740_992;

#[derive(Debug, Clone)]
struct Seed {
    sku: String,
    price: i64,
    in_stock: bool,
    tags: Vec<&'static str>,
    color: Option<&'static str>,
    age_days: i64,
    discontinued: bool,
}

impl Seed {
    fn build(&self) -> Product {
        let mut p = product(&self.sku, self.price, self.in_stock);
        for tag in &self.tags {
            p.add_tag(*tag, t0()).unwrap();
        }
        if let Some(color) = self.color {
            p.set_attributes(json!({ "color": color, "size": self.price % 3 }), t0()).unwrap();
        }
        if self.discontinued {
            p.discontinue(t0() + Duration::days(self.age_days)).unwrap();
        }
        p
    }
}

fn price() -> impl Strategy<Value = i64> {
    prop_oneof![
        3 => 0i64..400,
        1 => BIG..BIG + 4,
        1 => (i64::MAX - 2)..=i64::MAX,
    ]
}

fn seed() -> impl Strategy<Value = Seed> {
    (
        "[a-cA-C]{1,4}",
        price(),
        any::<bool>(),
        proptest::sample::subsequence(vec!["sale", "new", "eco"], 0..=3),
        proptest::option::of(prop_oneof![Just("red"), Just("blue")]),
        -5i64..5,
        any::<bool>(),
    )
        .prop_map(|(sku, price, in_stock, tags, color, age_days, discontinued)| Seed {
            sku,
            price,
            in_stock,
            tags,
            color,
            age_days,
            discontinued,
        })
}

fn text_mode() -> impl Strategy<Value = TextMatch> {
    prop_oneof![
        Just(TextMatch::Contains),
        Just(TextMatch::StartsWith),
        Just(TextMatch::EndsWith),
        Just(TextMatch::Exact),
    ]
}

fn window() -> impl Strategy<Value = DateWindow> {
    prop_oneof![Just(DateWindow::Past), Just(DateWindow::Future), Just(DateWindow::Around)]
}

fn scalar_leaf() -> impl Strategy<Value = Spec<Product>> {
    prop_oneof![
        price().prop_map(|p| Spec::eq("price", p)),
        (price(), price()).prop_map(|(a, b)| Spec::range("price", a.min(b), a.max(b))),
        price().prop_map(|p| Spec::at_most("price", p)),
        any::<bool>().prop_map(|b| Spec::eq("in_stock", b)),
        ("[a-cA-C]{0,2}", text_mode(), any::<bool>())
            .prop_map(|(pattern, mode, cs)| Spec::text("sku", pattern, mode, cs).unwrap()),
        proptest::collection::vec(price(), 0..4).prop_map(|v| Spec::one_of("price", v)),
        proptest::collection::vec("[a-c]{1,2}", 0..3).prop_map(|v| Spec::none_of("sku", v)),
    ]
}

fn document_leaf() -> impl Strategy<Value = Spec<Product>> {
    prop_oneof![
        (proptest::option::of(0usize..3), proptest::option::of(0usize..3))
            .prop_map(|(min, max)| Spec::size_between("tags", min, max)),
        prop_oneof![Just("sale"), Just("new"), Just("eco"), Just("other")]
            .prop_map(|tag| Spec::has_element("tags", tag)),
        prop_oneof![Just(json!("red")), Just(json!("blue")), Just(json!(1))]
            .prop_map(|v| Spec::json_path("attributes", ["color"], v)),
        (0i64..3).prop_map(|n| Spec::json_path("attributes", ["size"], json!(n))),
        Just(Spec::is_null("discontinued_at")),
        (0u32..6, window()).prop_map(|(days, w)| Spec::within_days_of("discontinued_at", days, w, t0())),
        Just(Spec::eq("discontinued_at", Value::Null)),
    ]
}

/// Leaves SQLite cannot evaluate; they force the superset-plus-filter path.
fn residual_leaf() -> impl Strategy<Value = Spec<Product>> {
    prop_oneof![
        (prop_oneof![Just("^[ab]"), Just("c$"), Just("^[a-c]+$"), Just("b.")], any::<bool>())
            .prop_map(|(pattern, cs)| Spec::text("sku", pattern, TextMatch::Regex, cs).unwrap()),
        Just(Spec::predicate("even_price", |p: &Product| p.price().cents() % 2 == 0)),
    ]
}

fn leaf() -> impl Strategy<Value = Spec<Product>> {
    prop_oneof![
        3 => scalar_leaf(),
        3 => document_leaf(),
        1 => residual_leaf(),
    ]
}

fn spec() -> impl Strategy<Value = Spec<Product>> {
    leaf().prop_recursive(3, 12, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a & b),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a | b),
            inner.prop_map(|a| !a),
        ]
    })
}

fn list_shape() -> impl Strategy<Value = (Vec<(&'static str, SortDirection)>, u64, Option<u64>)> {
    let key = (
        prop_oneof![Just("price"), Just("sku"), Just("discontinued_at")],
        prop_oneof![Just(SortDirection::Asc), Just(SortDirection::Desc)],
    );
    (
        proptest::collection::vec(key, 0..3),
        0u64..4,
        proptest::option::of(0u64..5),
    )
}

fn id_of(p: &Product) -> String {
    p.id_typed().to_string()
}

/// Nulls last in both directions, then id ascending.
fn list_order(a: &Product, b: &Product, keys: &[(String, SortDirection)]) -> Ordering {
    for (field, direction) in keys {
        let x = a.attribute(field).unwrap_or(Value::Null);
        let y = b.attribute(field).unwrap_or(Value::Null);
        let ord = match (x.is_null() || y.is_null(), direction) {
            (false, SortDirection::Desc) => y.sort_cmp(&x),
            _ => x.sort_cmp(&y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    id_of(a).cmp(&id_of(b))
}

#[derive(Debug, PartialEq)]
struct Observed {
    found: Vec<String>,
    counted: u64,
    page: Vec<String>,
}

fn expected(products: &[Product], spec: &Spec<Product>, list: &ListQuery<Product>) -> Observed {
    let mut matches: Vec<&Product> = products.iter().filter(|p| spec.is_satisfied_by(*p)).collect();
    matches.sort_by(|a, b| id_of(a).cmp(&id_of(b)));
    let found: Vec<String> = matches.iter().map(|p| id_of(p)).collect();

    matches.sort_by(|a, b| list_order(a, b, &list.order_by));
    let page = list.pagination.apply(matches).into_iter().map(id_of).collect();

    Observed {
        counted: found.len() as u64,
        found,
        page,
    }
}

async fn observe<S: Store>(
    factory: &UnitOfWorkFactory<S>,
    products: Vec<Product>,
    spec: Spec<Product>,
    list: ListQuery<Product>,
) -> Result<Observed, RepositoryError> {
    factory
        .scope(|uow| async move {
            let repo = uow.get_repository::<ProductMapper>()?;
            for mut p in products {
                repo.add(&mut p).await?;
            }
            let found = repo.find(&spec).await?.iter().map(id_of).collect();
            let counted = repo.count(Some(&spec)).await?;
            let page = repo.list(&list).await?.iter().map(id_of).collect();
            Ok(Observed { found, counted, page })
        })
        .await
}

async fn compare(
    seeds: Vec<Seed>,
    spec: Spec<Product>,
    shape: (Vec<(&'static str, SortDirection)>, u64, Option<u64>),
) -> Result<(), TestCaseError> {
    let products: Vec<Product> = seeds.iter().map(Seed::build).collect();
    let (keys, offset, limit) = shape;
    let mut list = ListQuery::new().filter(spec.clone()).offset(offset);
    for (field, direction) in keys {
        list = list.order_by(field, direction);
    }
    if let Some(limit) = limit {
        list = list.limit(limit);
    }
    let want = expected(&products, &spec, &list);

    let mapper = ProductMapper::default();
    let exact = SqlTranslator::new(Dialect::Sqlite, mapper.schema()).translate(&spec).is_ok();

    let sqlite = sqlite_factory(EventPublisher::default()).await;
    let got = observe(&sqlite, products.clone(), spec.clone(), list.clone())
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(&got, &want, "sqlite, spec: {}", spec);
    prop_assert_eq!(sqlite.stats().fallbacks() == 0, exact, "spec: {}", spec);
    prop_assert_eq!(sqlite.stats().in_memory(), 0);

    let memory = memory_factory(EventPublisher::default());
    let got = observe(&memory, products, spec.clone(), list)
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(&got, &want, "in-memory, spec: {}", spec);
    prop_assert_eq!(memory.stats().fallbacks(), 0);
    prop_assert_eq!(memory.stats().translated(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stores_agree_with_in_memory_evaluation(
        seeds in proptest::collection::vec(seed(), 0..8),
        spec in spec(),
        shape in list_shape(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(compare(seeds, spec, shape))?;
    }
}
