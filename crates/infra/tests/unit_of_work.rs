//! Commit/event coupling, state transitions and concurrency, over the
//! in-memory store.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use keystone_core::{AggregateRoot, RuleSet, Spec};
use keystone_events::{
    CollectingFailureSink, EventBus, EventEnvelope, EventHandler, EventPublisher, EventSource, FailureKind,
    InMemoryEventBus,
};
use keystone_infra::{
    InstrumentedRepository, OrderMapper, ProductMapper, Repository, RepositoryError, UnitOfWorkState,
    ValidatingRepository,
};
use keystone_products::{Product, ProductId};
use keystone_sales::Order;

use common::{cents, memory_factory, product, t0, Recorder};

async fn seed_one(factory: &keystone_infra::UnitOfWorkFactory<keystone_infra::InMemoryStore>) -> ProductId {
    factory
        .scope(|uow| async move {
            let mut p = product("SEED", 1000, true);
            uow.get_repository::<ProductMapper>()?.add(&mut p).await?;
            Ok::<_, RepositoryError>(p.id_typed())
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn events_are_published_only_after_commit() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    let uow = factory.begin().await.unwrap();
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    let mut p = product("LAMP", 1000, false);
    repo.add(&mut p).await.unwrap();

    assert!(p.pending_events().is_empty());
    let queued = uow.pending_events();
    assert_eq!(queued.len(), 2);
    assert!(recorder.events().is_empty());
    assert!(factory.store().snapshot("products").is_empty());

    let report = uow.commit().await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(report.delivered, 2);
    assert!(report.handler_failures.is_empty());
    assert_eq!(uow.state(), UnitOfWorkState::Committed);

    assert_eq!(
        recorder.event_types(),
        vec!["products.product.created", "products.product.stock_changed"]
    );
    let sequences: Vec<u64> = recorder.events().iter().map(EventEnvelope::sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(factory.store().snapshot("products").len(), 1);
}

#[tokio::test]
async fn rollback_discards_writes_and_events() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    let uow = factory.begin().await.unwrap();
    let mut p = product("LAMP", 1000, true);
    let mut order = Order::create("ACME", t0()).unwrap();
    uow.get_repository::<ProductMapper>().unwrap().add(&mut p).await.unwrap();
    uow.get_repository::<OrderMapper>().unwrap().add(&mut order).await.unwrap();
    assert_eq!(uow.pending_events().len(), 2);

    uow.rollback().await.unwrap();

    assert_eq!(uow.state(), UnitOfWorkState::RolledBack);
    assert!(uow.pending_events().is_empty());
    assert!(recorder.events().is_empty());
    assert!(factory.store().snapshot("products").is_empty());
    assert!(factory.store().snapshot("orders").is_empty());
}

#[tokio::test]
async fn dropped_unit_of_work_rolls_back() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    {
        let uow = factory.begin().await.unwrap();
        let mut p = product("LOST", 1000, true);
        uow.get_repository::<ProductMapper>().unwrap().add(&mut p).await.unwrap();
    }

    assert!(factory.store().snapshot("products").is_empty());
    assert!(recorder.events().is_empty());

    let uow = factory.begin().await.unwrap();
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    assert_eq!(repo.count(None).await.unwrap(), 0);
}

#[derive(Debug, PartialEq)]
enum AppError {
    Repository(RepositoryError),
    Rejected(&'static str),
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::Repository(err)
    }
}

#[tokio::test]
async fn scope_commits_on_ok_and_rolls_back_on_err() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    let id = factory
        .scope(|uow| async move {
            let mut p = product("KEPT", 1000, true);
            uow.get_repository::<ProductMapper>()?.add(&mut p).await?;
            Ok::<_, AppError>(p.id_typed())
        })
        .await
        .unwrap();
    assert_eq!(recorder.event_types(), vec!["products.product.created"]);

    let err = factory
        .scope(|uow| async move {
            let repo = uow.get_repository::<ProductMapper>()?;
            let mut kept = repo.get_or_fail(&id).await?;
            kept.change_price(cents(2000), t0()).map_err(|_| AppError::Rejected("price"))?;
            repo.update(&mut kept).await?;
            let mut extra = product("DROPPED", 1, true);
            repo.add(&mut extra).await?;
            Err::<(), _>(AppError::Rejected("changed my mind"))
        })
        .await
        .unwrap_err();

    assert_eq!(err, AppError::Rejected("changed my mind"));
    assert_eq!(recorder.events().len(), 1);

    let rows = factory.store().snapshot("products");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 1);
}

#[tokio::test]
async fn ended_unit_of_work_rejects_further_use() {
    let factory = memory_factory(EventPublisher::default());

    let uow = factory.create();
    assert_eq!(uow.state(), UnitOfWorkState::NotStarted);
    assert!(matches!(uow.commit().await, Err(RepositoryError::InvalidState(_))));
    assert!(matches!(uow.get_repository::<ProductMapper>(), Err(RepositoryError::InvalidState(_))));

    uow.begin().await.unwrap();
    assert!(matches!(uow.begin().await, Err(RepositoryError::InvalidState(_))));
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    uow.commit().await.unwrap();

    assert!(matches!(uow.commit().await, Err(RepositoryError::InvalidState(_))));
    assert!(matches!(uow.rollback().await, Err(RepositoryError::InvalidState(_))));
    assert!(matches!(uow.get_repository::<ProductMapper>(), Err(RepositoryError::InvalidState(_))));
    assert!(matches!(repo.count(None).await, Err(RepositoryError::InvalidState(_))));
}

#[tokio::test]
async fn exactly_one_of_two_writers_wins() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());
    let id = seed_one(&factory).await;

    let (left, right) = (factory.begin().await.unwrap(), factory.begin().await.unwrap());
    let mut a = left.get_repository::<ProductMapper>().unwrap().get_or_fail(&id).await.unwrap();
    let mut b = right.get_repository::<ProductMapper>().unwrap().get_or_fail(&id).await.unwrap();

    a.change_price(cents(1100), t0()).unwrap();
    b.change_price(cents(1200), t0()).unwrap();
    left.get_repository::<ProductMapper>().unwrap().update(&mut a).await.unwrap();
    right.get_repository::<ProductMapper>().unwrap().update(&mut b).await.unwrap();

    let (l, r) = tokio::join!(left.commit(), right.commit());
    let outcomes = [l.is_ok(), r.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "{l:?} / {r:?}");

    let loser = if l.is_ok() { r.unwrap_err() } else { l.unwrap_err() };
    assert!(loser.is_conflict(), "{loser:?}");
    let loser_uow = if outcomes[0] { &right } else { &left };
    assert_eq!(loser_uow.state(), UnitOfWorkState::RolledBack);

    let price_changes = recorder
        .event_types()
        .into_iter()
        .filter(|t| t == "products.product.price_changed")
        .count();
    assert_eq!(price_changes, 1);
    assert_eq!(factory.store().snapshot("products")[0].version, 2);
}

#[tokio::test]
async fn writes_are_isolated_until_commit() {
    let factory = memory_factory(EventPublisher::default());

    let writer = factory.begin().await.unwrap();
    let reader = factory.begin().await.unwrap();
    let mut p = product("HIDDEN", 500, true);
    writer.get_repository::<ProductMapper>().unwrap().add(&mut p).await.unwrap();

    let peek = reader.get_repository::<ProductMapper>().unwrap();
    assert!(peek.get(&p.id_typed()).await.unwrap().is_none());

    writer.commit().await.unwrap();
    assert!(peek.get(&p.id_typed()).await.unwrap().is_some());
}

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    }
}

struct Exploding;

#[async_trait]
impl EventHandler for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn handles(&self, event_type: &str) -> bool {
        event_type == "sales.order.created"
    }

    async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
        panic!("handler bug")
    }
}

#[tokio::test]
async fn handler_failures_do_not_undo_the_commit() {
    let recorder = Recorder::default();
    let sink = Arc::new(CollectingFailureSink::new());
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(Failing), Arc::new(Exploding), recorder.handler()];
    let publisher = EventPublisher::new(handlers).with_sink(sink.clone());
    let factory = memory_factory(publisher);

    let uow = factory.begin().await.unwrap();
    let mut order = Order::create("ACME", t0()).unwrap();
    uow.get_repository::<OrderMapper>().unwrap().add(&mut order).await.unwrap();
    let report = uow.commit().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.handler_failures.len(), 2);
    assert!(matches!(report.handler_failures[0].kind, FailureKind::Error(_)));
    assert!(matches!(report.handler_failures[1].kind, FailureKind::Panic(_)));
    assert_eq!(sink.failures(), report.handler_failures);

    assert_eq!(recorder.event_types(), vec!["sales.order.created"]);
    assert_eq!(factory.store().snapshot("orders").len(), 1);
}

#[tokio::test]
async fn empty_order_cannot_be_placed() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    let mut order = Order::create("ACME", t0()).unwrap();
    order.clear_events();

    assert!(order.place(t0()).is_err());
    assert!(order.pending_events().is_empty());

    let uow = factory.begin().await.unwrap();
    uow.get_repository::<OrderMapper>().unwrap().add(&mut order).await.unwrap();
    let report = uow.commit().await.unwrap();
    assert_eq!(report.published, 0);
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn many_variants_share_the_transaction() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());

    let uow = factory.begin().await.unwrap();
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    let mut batch = vec![product("M1", 100, true), product("M2", 200, true), product("M3", 300, true)];
    repo.add_many(&mut batch).await.unwrap();
    for p in batch.iter_mut() {
        p.change_price(cents(p.price().cents() + 1), t0()).unwrap();
    }
    repo.update_many(&mut batch).await.unwrap();
    assert!(batch.iter().all(|p| p.version() == 2));

    repo.delete_many(&mut batch[..1]).await.unwrap();
    assert_eq!(repo.count(None).await.unwrap(), 2);
    uow.commit().await.unwrap();

    assert_eq!(recorder.events().len(), 6);
    assert_eq!(factory.store().snapshot("products").len(), 2);
}

#[tokio::test]
async fn deleting_discards_unsaved_changes_and_their_events() {
    let recorder = Recorder::default();
    let factory = memory_factory(recorder.publisher());
    let id = seed_one(&factory).await;
    let published_before = recorder.event_types();

    let uow = factory.begin().await.unwrap();
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    let mut doomed = repo.get_or_fail(&id).await.unwrap();
    doomed.change_price(cents(4200), t0()).unwrap();
    doomed.add_tag("clearance", t0()).unwrap();
    assert_eq!(doomed.pending_events().len(), 2);

    repo.delete(&mut doomed).await.unwrap();
    assert!(doomed.pending_events().is_empty());
    assert!(uow.pending_events().is_empty());

    let report = uow.commit().await.unwrap();
    assert_eq!(report.published, 0);
    assert_eq!(recorder.event_types(), published_before);
    assert!(factory.store().snapshot("products").is_empty());
}

#[tokio::test]
async fn decorators_validate_and_pass_through() {
    let factory = memory_factory(EventPublisher::default());
    let uow = factory.begin().await.unwrap();

    let rules = RuleSet::<Product>::new().with_rule(Spec::at_least("price", 100), "price must be at least 1.00");
    let repo = InstrumentedRepository::new(
        ValidatingRepository::new(uow.get_repository::<ProductMapper>().unwrap(), rules),
        "Product",
    );

    let mut cheap = product("CHEAP", 50, true);
    let err = repo.add(&mut cheap).await.unwrap_err();
    assert_eq!(err, RepositoryError::Validation("price must be at least 1.00".to_string()));
    assert!(cheap.is_transient());

    let mut fine = product("FINE", 150, true);
    repo.add(&mut fine).await.unwrap();
    assert_eq!(repo.count(None).await.unwrap(), 1);

    fine.change_price(cents(10), t0()).unwrap();
    assert!(matches!(repo.update(&mut fine).await, Err(RepositoryError::Validation(_))));

    uow.commit().await.unwrap();
    let rows = factory.store().snapshot("products");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("price_cents"), Some(keystone_core::Value::Int(150)));
}

#[tokio::test]
async fn in_memory_queries_are_counted() {
    let factory = memory_factory(EventPublisher::default());
    seed_one(&factory).await;

    let uow = factory.begin().await.unwrap();
    let repo = uow.get_repository::<ProductMapper>().unwrap();
    assert_eq!(repo.find(&Spec::eq("sku", "SEED")).await.unwrap().len(), 1);
    assert_eq!(factory.stats().in_memory(), 1);
    assert_eq!(factory.stats().fallbacks(), 0);
}

#[tokio::test]
async fn bus_subscribers_see_committed_events_only() {
    let bus = Arc::new(InMemoryEventBus::<EventEnvelope>::new());
    let subscription = bus.subscribe();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![bus.clone()];
    let factory = memory_factory(EventPublisher::new(handlers));

    let discarded = factory.begin().await.unwrap();
    let mut lost = product("LOST", 100, true);
    discarded.get_repository::<ProductMapper>().unwrap().add(&mut lost).await.unwrap();
    discarded.rollback().await.unwrap();
    assert!(subscription.drain().is_empty());

    let id = seed_one(&factory).await;
    let received = subscription.drain();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event_type(), "products.product.created");
    assert_eq!(received[0].aggregate_id(), id.0);
}
