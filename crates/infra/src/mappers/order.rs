use keystone_core::{AggregateRoot, Entity, Value};
use keystone_sales::{Order, OrderState};

use crate::mapper::{ColumnKind, EntityMapper, MappingError, Record, TableSchema};

/// `orders` table. Lines are stored as one JSON array; `total_cents` is a
/// denormalized copy of the order total so it can be filtered natively.
#[derive(Debug, Clone)]
pub struct OrderMapper {
    schema: TableSchema,
}

impl Default for OrderMapper {
    fn default() -> Self {
        Self {
            schema: TableSchema::new("Order", "orders")
                .column("customer", "customer", ColumnKind::Text)
                .column("status", "status", ColumnKind::Text)
                .column("line_count", "line_count", ColumnKind::Int)
                .column("total_cents", "total", ColumnKind::Int)
                .column("lines", "lines", ColumnKind::Json)
                .column("created_at", "created_at", ColumnKind::Timestamp)
                .column("placed_at", "placed_at", ColumnKind::Timestamp),
        }
    }
}

impl EntityMapper for OrderMapper {
    type Entity = Order;

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn to_model(&self, order: &Order) -> Record {
        let lines = serde_json::to_value(order.lines()).map_or(Value::Null, Value::Json);
        Record::new(self.encode_id(order.id()), order.version())
            .with("customer", order.customer())
            .with("status", order.status().as_str())
            .with("line_count", i64::try_from(order.lines().len()).ok())
            .with("total_cents", order.total().ok().map(|t| t.cents()))
            .with("lines", lines)
            .with("created_at", order.created_at())
            .with("placed_at", order.placed_at())
    }

    fn to_entity(&self, record: Record) -> Result<Order, MappingError> {
        let state = OrderState {
            id: record.id.parse().map_err(|e| MappingError::invalid("id", e))?,
            customer: record.text("customer")?,
            status: record
                .text("status")?
                .parse()
                .map_err(|e| MappingError::invalid("status", e))?,
            lines: record.decode("lines")?,
            created_at: record.timestamp("created_at")?,
            placed_at: record.opt_timestamp("placed_at")?,
        };
        Ok(Order::restore(state, record.version))
    }
}
