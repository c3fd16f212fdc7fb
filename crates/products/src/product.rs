use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keystone_core::{
    Aggregate, AggregateId, AggregateRoot, Attributes, DomainError, DomainResult, Entity,
    Identity, Value,
};
use keystone_events::{DomainEvent, EventBuffer, EventSource};

use crate::money::Money;

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl Identity for ProductId {
    fn generate() -> Self {
        Self(AggregateId::generate())
    }

    fn unassigned() -> Self {
        Self(AggregateId::unassigned())
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductPriceChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPriceChanged {
    pub product_id: ProductId,
    pub old_price: Money,
    pub new_price: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductStockChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStockChanged {
    pub product_id: ProductId,
    pub in_stock: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductTagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductTagged {
    pub product_id: ProductId,
    pub tag: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductAttributesChanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttributesChanged {
    pub product_id: ProductId,
    pub attributes: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductDiscontinued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDiscontinued {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductEvent {
    Created(ProductCreated),
    PriceChanged(ProductPriceChanged),
    StockChanged(ProductStockChanged),
    Tagged(ProductTagged),
    AttributesChanged(ProductAttributesChanged),
    Discontinued(ProductDiscontinued),
}

impl DomainEvent for ProductEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductEvent::Created(_) => "products.product.created",
            ProductEvent::PriceChanged(_) => "products.product.price_changed",
            ProductEvent::StockChanged(_) => "products.product.stock_changed",
            ProductEvent::Tagged(_) => "products.product.tagged",
            ProductEvent::AttributesChanged(_) => "products.product.attributes_changed",
            ProductEvent::Discontinued(_) => "products.product.discontinued",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::Created(e) => e.occurred_at,
            ProductEvent::PriceChanged(e) => e.occurred_at,
            ProductEvent::StockChanged(e) => e.occurred_at,
            ProductEvent::Tagged(e) => e.occurred_at,
            ProductEvent::AttributesChanged(e) => e.occurred_at,
            ProductEvent::Discontinued(e) => e.occurred_at,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        let id = match self {
            ProductEvent::Created(e) => e.product_id,
            ProductEvent::PriceChanged(e) => e.product_id,
            ProductEvent::StockChanged(e) => e.product_id,
            ProductEvent::Tagged(e) => e.product_id,
            ProductEvent::AttributesChanged(e) => e.product_id,
            ProductEvent::Discontinued(e) => e.product_id,
        };
        id.0
    }

    fn aggregate_type(&self) -> &'static str {
        Product::AGGREGATE_TYPE
    }
}

/// Persisted state of a product, as read back by a mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductState {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    pub in_stock: bool,
    pub tags: Vec<String>,
    pub attributes: JsonValue,
    pub created_at: DateTime<Utc>,
    pub discontinued_at: Option<DateTime<Utc>>,
}

/// Aggregate root: Product.
///
/// Equality is identity: two products with the same id are the same product.
/// Use [`Product::same_state`] to compare contents.
#[derive(Debug, Clone)]
pub struct Product {
    state: ProductState,
    version: u64,
    events: EventBuffer<ProductEvent>,
}

impl Product {
    pub const AGGREGATE_TYPE: &'static str = "products.product";

    /// Create a new, in-stock product and record `ProductCreated`.
    pub fn create(
        sku: impl Into<String>,
        name: impl Into<String>,
        price: Money,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let sku = sku.into().trim().to_string();
        let name = name.into().trim().to_string();
        if sku.is_empty() {
            return Err(DomainError::validation("sku must not be empty"));
        }
        if name.is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }

        let mut product = Self::blank(ProductId::generate(), now);
        product.raise(ProductEvent::Created(ProductCreated {
            product_id: product.state.id,
            sku,
            name,
            price,
            occurred_at: now,
        }));
        Ok(product)
    }

    /// Rebuild from persisted state. Records no events.
    pub fn restore(state: ProductState, version: u64) -> Self {
        Self {
            state,
            version,
            events: EventBuffer::new(),
        }
    }

    fn blank(id: ProductId, now: DateTime<Utc>) -> Self {
        Self::restore(
            ProductState {
                id,
                sku: String::new(),
                name: String::new(),
                price: Money::zero(),
                in_stock: false,
                tags: Vec::new(),
                attributes: JsonValue::Object(Default::default()),
                created_at: now,
                discontinued_at: None,
            },
            0,
        )
    }

    pub fn id_typed(&self) -> ProductId {
        self.state.id
    }

    pub fn sku(&self) -> &str {
        &self.state.sku
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn price(&self) -> Money {
        self.state.price
    }

    pub fn in_stock(&self) -> bool {
        self.state.in_stock
    }

    pub fn tags(&self) -> &[String] {
        &self.state.tags
    }

    pub fn attributes(&self) -> &JsonValue {
        &self.state.attributes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at
    }

    pub fn discontinued_at(&self) -> Option<DateTime<Utc>> {
        self.state.discontinued_at
    }

    pub fn is_discontinued(&self) -> bool {
        self.state.discontinued_at.is_some()
    }

    pub fn state(&self) -> &ProductState {
        &self.state
    }

    /// Field-by-field comparison, including version.
    pub fn same_state(&self, other: &Product) -> bool {
        self.state == other.state && self.version == other.version
    }

    pub fn change_price(&mut self, price: Money, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active()?;
        if price == self.state.price {
            return Ok(());
        }
        self.raise(ProductEvent::PriceChanged(ProductPriceChanged {
            product_id: self.state.id,
            old_price: self.state.price,
            new_price: price,
            occurred_at: now,
        }));
        Ok(())
    }

    pub fn set_in_stock(&mut self, in_stock: bool, now: DateTime<Utc>) -> DomainResult<()> {
        if in_stock {
            self.ensure_active()?;
        }
        if in_stock == self.state.in_stock {
            return Ok(());
        }
        self.raise(ProductEvent::StockChanged(ProductStockChanged {
            product_id: self.state.id,
            in_stock,
            occurred_at: now,
        }));
        Ok(())
    }

    pub fn add_tag(&mut self, tag: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        let tag = tag.into().trim().to_lowercase();
        if tag.is_empty() {
            return Err(DomainError::validation("tag must not be empty"));
        }
        if self.state.tags.contains(&tag) {
            return Ok(());
        }
        self.raise(ProductEvent::Tagged(ProductTagged {
            product_id: self.state.id,
            tag,
            occurred_at: now,
        }));
        Ok(())
    }

    /// Replace the free-form attribute document. Must be a JSON object.
    pub fn set_attributes(&mut self, attributes: JsonValue, now: DateTime<Utc>) -> DomainResult<()> {
        if !attributes.is_object() {
            return Err(DomainError::validation("attributes must be a JSON object"));
        }
        self.raise(ProductEvent::AttributesChanged(ProductAttributesChanged {
            product_id: self.state.id,
            attributes,
            occurred_at: now,
        }));
        Ok(())
    }

    pub fn discontinue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active()?;
        self.raise(ProductEvent::Discontinued(ProductDiscontinued {
            product_id: self.state.id,
            occurred_at: now,
        }));
        Ok(())
    }

    fn ensure_active(&self) -> DomainResult<()> {
        if self.is_discontinued() {
            return Err(DomainError::invariant("product is discontinued"));
        }
        Ok(())
    }

    fn raise(&mut self, event: ProductEvent) {
        self.apply(&event);
        self.events.record(event);
    }
}

impl PartialEq for Product {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id
    }
}

impl Eq for Product {}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn assign_id(&mut self, id: Self::Id) {
        self.state.id = id;
    }
}

impl AggregateRoot for Product {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for Product {
    type Event = ProductEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductEvent::Created(e) => {
                self.state.id = e.product_id;
                self.state.sku = e.sku.clone();
                self.state.name = e.name.clone();
                self.state.price = e.price;
                self.state.in_stock = true;
                self.state.created_at = e.occurred_at;
            }
            ProductEvent::PriceChanged(e) => {
                self.state.price = e.new_price;
            }
            ProductEvent::StockChanged(e) => {
                self.state.in_stock = e.in_stock;
            }
            ProductEvent::Tagged(e) => {
                self.state.tags.push(e.tag.clone());
            }
            ProductEvent::AttributesChanged(e) => {
                self.state.attributes = e.attributes.clone();
            }
            ProductEvent::Discontinued(e) => {
                self.state.discontinued_at = Some(e.occurred_at);
                self.state.in_stock = false;
            }
        }
    }
}

impl EventSource for Product {
    type Event = ProductEvent;

    fn pending_events(&self) -> &[ProductEvent] {
        self.events.pending()
    }

    fn clear_events(&mut self) -> Vec<ProductEvent> {
        self.events.clear_events()
    }
}

impl Attributes for Product {
    fn attribute(&self, field: &str) -> Option<Value> {
        let s = &self.state;
        Some(match field {
            "id" => Value::Text(s.id.to_string()),
            "sku" => Value::from(s.sku.as_str()),
            "name" => Value::from(s.name.as_str()),
            "price" => Value::Int(s.price.cents()),
            "in_stock" => Value::Bool(s.in_stock),
            "tags" => Value::from(s.tags.clone()),
            "attributes" => Value::Json(s.attributes.clone()),
            "created_at" => Value::Timestamp(s.created_at),
            "discontinued_at" => Value::from(s.discontinued_at),
            "version" => Value::Int(i64::try_from(self.version).ok()?),
            _ => return None,
        })
    }
}
