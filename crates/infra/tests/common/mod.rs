//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use keystone_events::{EventEnvelope, EventHandler, EventPublisher, FnHandler};
use keystone_infra::{
    EntityMapper, InMemoryStore, OrderMapper, ProductMapper, SqlStore, StoreConfig, UnitOfWorkFactory,
};
use keystone_products::{Money, Product};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn cents(c: i64) -> Money {
    Money::from_cents(c).unwrap()
}

pub fn product(sku: &str, price: i64, in_stock: bool) -> Product {
    let mut product = Product::create(sku, format!("Product {sku}"), cents(price), t0()).unwrap();
    product.set_in_stock(in_stock, t0()).unwrap();
    product
}

/// Fresh in-memory SQLite database with the sample tables created.
pub async fn sqlite_store() -> SqlStore {
    keystone_observability::init();
    let store = SqlStore::connect(&StoreConfig::default()).await.unwrap();
    store.ensure_table(ProductMapper::default().schema()).await.unwrap();
    store.ensure_table(OrderMapper::default().schema()).await.unwrap();
    store
}

pub async fn sqlite_factory(publisher: EventPublisher) -> UnitOfWorkFactory<SqlStore> {
    UnitOfWorkFactory::new(sqlite_store().await, publisher)
}

/// SQLite database file that is removed on drop.
///
/// Unlike `sqlite::memory:`, a file database is shared by every pooled
/// connection, so units of work really run side by side.
pub struct SqliteFile {
    path: PathBuf,
}

impl SqliteFile {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("keystone-{name}-{}.db", keystone_core::AggregateId::new()));
        Self { path }
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::default()
            .with_database_url(format!("sqlite://{}?mode=rwc", self.path.display()))
            .with_max_connections(4)
    }

    pub async fn factory(&self, publisher: EventPublisher) -> UnitOfWorkFactory<SqlStore> {
        keystone_observability::init();
        let store = SqlStore::connect(&self.config()).await.unwrap();
        store.ensure_table(ProductMapper::default().schema()).await.unwrap();
        UnitOfWorkFactory::new(store, publisher)
    }
}

impl Drop for SqliteFile {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn memory_factory(publisher: EventPublisher) -> UnitOfWorkFactory<InMemoryStore> {
    keystone_observability::init();
    UnitOfWorkFactory::new(InMemoryStore::new(), publisher)
}

/// Handler that remembers every envelope it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl Recorder {
    pub fn handler(&self) -> Arc<dyn EventHandler> {
        let seen = Arc::clone(&self.seen);
        Arc::new(FnHandler::new("recorder", move |event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(event);
                Ok::<_, anyhow::Error>(())
            }
        }))
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(vec![self.handler()])
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.seen.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().iter().map(|e| e.event_type().to_string()).collect()
    }
}
