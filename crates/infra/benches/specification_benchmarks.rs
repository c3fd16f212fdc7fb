use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{TimeZone, Utc};
use keystone_core::{Spec, Specification, TextMatch};
use keystone_infra::{Dialect, EntityMapper, ProductMapper, SqlTranslator};
use keystone_products::{Money, Product};
use serde_json::json;

fn catalog(size: usize) -> Vec<Product> {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    (0..size)
        .map(|i| {
            let price = Money::from_cents((i as i64 % 500) * 10).unwrap();
            let mut product = Product::create(format!("SKU-{i:05}"), format!("Item {i}"), price, now).unwrap();
            if i % 3 == 0 {
                product.add_tag("sale", now).unwrap();
            }
            product
                .set_attributes(json!({ "color": if i % 2 == 0 { "red" } else { "blue" } }), now)
                .unwrap();
            product
        })
        .collect()
}

fn composite_spec() -> Spec<Product> {
    let priced = Spec::range("price", 1_000, 3_000);
    let sku = Spec::text("sku", "sku-0", TextMatch::StartsWith, false).unwrap();
    let tagged = Spec::has_element("tags", "sale");
    let red = Spec::json_path("attributes", ["color"], json!("red"));
    (priced & sku) | (tagged & !red)
}

fn bench_in_memory_evaluation(c: &mut Criterion) {
    let spec = composite_spec();
    let mut group = c.benchmark_group("spec_evaluation");

    for size in [100usize, 1_000, 10_000] {
        let products = catalog(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &products, |b, products| {
            b.iter(|| {
                products
                    .iter()
                    .filter(|p| spec.is_satisfied_by(black_box(*p)))
                    .count()
            })
        });
    }

    group.finish();
}

fn bench_translation(c: &mut Criterion) {
    let mapper = ProductMapper::default();
    let spec = composite_spec();
    let mut group = c.benchmark_group("spec_translation");

    for dialect in [Dialect::Sqlite, Dialect::Postgres] {
        let translator = SqlTranslator::new(dialect, mapper.schema());
        group.bench_function(format!("{dialect:?}"), |b| {
            b.iter(|| {
                let fragment = translator.translate(black_box(&spec)).unwrap();
                fragment.render(dialect)
            })
        });
    }

    let with_predicate = composite_spec() & Spec::predicate("even_name", |p: &Product| p.name().len() % 2 == 0);
    let translator = SqlTranslator::new(Dialect::Sqlite, mapper.schema());
    group.bench_function("plan_with_predicate", |b| b.iter(|| translator.plan(black_box(&with_predicate))));

    group.finish();
}

criterion_group!(benches, bench_in_memory_evaluation, bench_translation);
criterion_main!(benches);
