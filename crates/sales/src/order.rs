use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keystone_core::{
    Aggregate, AggregateId, AggregateRoot, Attributes, DomainError, DomainResult, Entity,
    Identity, Value,
};
use keystone_events::{DomainEvent, EventBuffer, EventSource};
use keystone_products::{Money, ProductId};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl Identity for OrderId {
    fn generate() -> Self {
        Self(AggregateId::generate())
    }

    fn unassigned() -> Self {
        Self(AggregateId::unassigned())
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for OrderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Draft,
    Placed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Placed => "placed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OrderStatus::Draft),
            "placed" => Ok(OrderStatus::Placed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown order status `{other}`"))),
        }
    }
}

/// Order line: a child entity identified by `line_no` within its order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Money,
}

impl OrderLine {
    pub fn total(&self) -> DomainResult<Money> {
        self.unit_price.times(self.quantity)
    }
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub customer: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRemoved {
    pub order_id: OrderId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub total: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created(OrderCreated),
    LineAdded(LineAdded),
    LineRemoved(LineRemoved),
    Placed(OrderPlaced),
    Cancelled(OrderCancelled),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => "sales.order.created",
            OrderEvent::LineAdded(_) => "sales.order.line_added",
            OrderEvent::LineRemoved(_) => "sales.order.line_removed",
            OrderEvent::Placed(_) => "sales.order.placed",
            OrderEvent::Cancelled(_) => "sales.order.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Created(e) => e.occurred_at,
            OrderEvent::LineAdded(e) => e.occurred_at,
            OrderEvent::LineRemoved(e) => e.occurred_at,
            OrderEvent::Placed(e) => e.occurred_at,
            OrderEvent::Cancelled(e) => e.occurred_at,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        let id = match self {
            OrderEvent::Created(e) => e.order_id,
            OrderEvent::LineAdded(e) => e.order_id,
            OrderEvent::LineRemoved(e) => e.order_id,
            OrderEvent::Placed(e) => e.order_id,
            OrderEvent::Cancelled(e) => e.order_id,
        };
        id.0
    }

    fn aggregate_type(&self) -> &'static str {
        Order::AGGREGATE_TYPE
    }
}

/// Persisted state of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderState {
    pub id: OrderId,
    pub customer: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
    pub placed_at: Option<DateTime<Utc>>,
}

/// Aggregate root: Order.
///
/// Lines are only reachable through the root; every rule spanning lines (at
/// least one line to place, draft-only edits) lives in root methods.
#[derive(Debug, Clone)]
pub struct Order {
    state: OrderState,
    version: u64,
    events: EventBuffer<OrderEvent>,
}

impl Order {
    pub const AGGREGATE_TYPE: &'static str = "sales.order";

    pub fn create(customer: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        let customer = customer.into().trim().to_string();
        if customer.is_empty() {
            return Err(DomainError::validation("customer must not be empty"));
        }

        let mut order = Self::empty(OrderId::generate(), now);
        order.raise(OrderEvent::Created(OrderCreated {
            order_id: order.state.id,
            customer,
            occurred_at: now,
        }));
        Ok(order)
    }

    /// Rebuild from persisted state. Records no events.
    pub fn restore(state: OrderState, version: u64) -> Self {
        Self {
            state,
            version,
            events: EventBuffer::new(),
        }
    }

    /// Create an empty, not-yet-created instance for rehydration from history.
    pub fn empty(id: OrderId, now: DateTime<Utc>) -> Self {
        Self::restore(
            OrderState {
                id,
                customer: String::new(),
                status: OrderStatus::Draft,
                lines: Vec::new(),
                created_at: now,
                placed_at: None,
            },
            0,
        )
    }

    pub fn id_typed(&self) -> OrderId {
        self.state.id
    }

    pub fn customer(&self) -> &str {
        &self.state.customer
    }

    pub fn status(&self) -> OrderStatus {
        self.state.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.state.lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.created_at
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.state.placed_at
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self.state.status, OrderStatus::Draft)
    }

    pub fn total(&self) -> DomainResult<Money> {
        self.state
            .lines
            .iter()
            .try_fold(Money::zero(), |acc, line| acc.checked_add(line.total()?))
    }

    pub fn same_state(&self, other: &Order) -> bool {
        self.state == other.state && self.version == other.version
    }

    pub fn add_line(
        &mut self,
        product_id: ProductId,
        quantity: i64,
        unit_price: Money,
        now: DateTime<Utc>,
    ) -> DomainResult<u32> {
        self.ensure_modifiable()?;
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        let line = OrderLine {
            line_no: self.next_line_no(),
            product_id,
            quantity,
            unit_price,
        };
        line.total()?;

        let line_no = line.line_no;
        self.raise(OrderEvent::LineAdded(LineAdded {
            order_id: self.state.id,
            line,
            occurred_at: now,
        }));
        Ok(line_no)
    }

    pub fn remove_line(&mut self, line_no: u32, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_modifiable()?;
        if !self.state.lines.iter().any(|l| l.line_no == line_no) {
            return Err(DomainError::not_found(format!("order line {line_no}")));
        }
        self.raise(OrderEvent::LineRemoved(LineRemoved {
            order_id: self.state.id,
            line_no,
            occurred_at: now,
        }));
        Ok(())
    }

    /// Submit the order. An order without lines cannot be placed; a failed
    /// attempt leaves state and pending events untouched.
    pub fn place(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_modifiable()?;
        if self.state.lines.is_empty() {
            return Err(DomainError::invariant("cannot place an order without lines"));
        }
        let total = self.total()?;
        self.raise(OrderEvent::Placed(OrderPlaced {
            order_id: self.state.id,
            total,
            occurred_at: now,
        }));
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state.status == OrderStatus::Cancelled {
            return Err(DomainError::conflict("order already cancelled"));
        }
        self.raise(OrderEvent::Cancelled(OrderCancelled {
            order_id: self.state.id,
            reason: reason.into(),
            occurred_at: now,
        }));
        Ok(())
    }

    fn ensure_modifiable(&self) -> DomainResult<()> {
        if !self.is_modifiable() {
            return Err(DomainError::invariant(format!(
                "cannot modify order once it is {}",
                self.state.status.as_str()
            )));
        }
        Ok(())
    }

    fn next_line_no(&self) -> u32 {
        self.state.lines.iter().map(|l| l.line_no).max().unwrap_or(0) + 1
    }

    fn raise(&mut self, event: OrderEvent) {
        self.apply(&event);
        self.events.record(event);
    }
}

impl PartialEq for Order {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id
    }
}

impl Eq for Order {}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn assign_id(&mut self, id: Self::Id) {
        self.state.id = id;
    }
}

impl AggregateRoot for Order {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl Aggregate for Order {
    type Event = OrderEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created(e) => {
                self.state.id = e.order_id;
                self.state.customer = e.customer.clone();
                self.state.status = OrderStatus::Draft;
                self.state.lines.clear();
                self.state.created_at = e.occurred_at;
            }
            OrderEvent::LineAdded(e) => {
                self.state.lines.push(e.line.clone());
            }
            OrderEvent::LineRemoved(e) => {
                self.state.lines.retain(|l| l.line_no != e.line_no);
            }
            OrderEvent::Placed(e) => {
                self.state.status = OrderStatus::Placed;
                self.state.placed_at = Some(e.occurred_at);
            }
            OrderEvent::Cancelled(_) => {
                self.state.status = OrderStatus::Cancelled;
            }
        }
    }
}

impl EventSource for Order {
    type Event = OrderEvent;

    fn pending_events(&self) -> &[OrderEvent] {
        self.events.pending()
    }

    fn clear_events(&mut self) -> Vec<OrderEvent> {
        self.events.clear_events()
    }
}

impl Attributes for Order {
    fn attribute(&self, field: &str) -> Option<Value> {
        let s = &self.state;
        Some(match field {
            "id" => Value::Text(s.id.to_string()),
            "customer" => Value::from(s.customer.as_str()),
            "status" => Value::from(s.status.as_str()),
            "line_count" => Value::Int(i64::try_from(s.lines.len()).ok()?),
            "total" => match self.total() {
                Ok(total) => Value::Int(total.cents()),
                Err(_) => Value::Null,
            },
            "lines" => Value::Json(serde_json::to_value(&s.lines).ok()?),
            "created_at" => Value::Timestamp(s.created_at),
            "placed_at" => Value::from(s.placed_at),
            "version" => Value::Int(i64::try_from(self.version).ok()?),
            _ => return None,
        })
    }
}
