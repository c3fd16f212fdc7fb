use keystone_core::{AggregateRoot, Entity, Value};
use keystone_products::{Money, Product, ProductState};

use crate::mapper::{ColumnKind, EntityMapper, MappingError, Record, TableSchema};

/// `products` table.
///
/// `price` is flattened to integer cents; tags and free-form attributes are
/// JSON columns.
#[derive(Debug, Clone)]
pub struct ProductMapper {
    schema: TableSchema,
}

impl Default for ProductMapper {
    fn default() -> Self {
        Self::with_table("products")
    }
}

impl ProductMapper {
    pub fn with_table(table: &str) -> Self {
        Self {
            schema: TableSchema::new("Product", table)
                .column("sku", "sku", ColumnKind::Text)
                .column("name", "name", ColumnKind::Text)
                .column("price_cents", "price", ColumnKind::Int)
                .column("in_stock", "in_stock", ColumnKind::Bool)
                .column("tags", "tags", ColumnKind::Json)
                .column("attributes", "attributes", ColumnKind::Json)
                .column("created_at", "created_at", ColumnKind::Timestamp)
                .column("discontinued_at", "discontinued_at", ColumnKind::Timestamp),
        }
    }
}

impl EntityMapper for ProductMapper {
    type Entity = Product;

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn to_model(&self, product: &Product) -> Record {
        Record::new(self.encode_id(product.id()), product.version())
            .with("sku", product.sku())
            .with("name", product.name())
            .with("price_cents", product.price().cents())
            .with("in_stock", product.in_stock())
            .with("tags", Value::from(product.tags().to_vec()))
            .with("attributes", Value::Json(product.attributes().clone()))
            .with("created_at", product.created_at())
            .with("discontinued_at", product.discontinued_at())
    }

    fn to_entity(&self, record: Record) -> Result<Product, MappingError> {
        let state = ProductState {
            id: record.id.parse().map_err(|e| MappingError::invalid("id", e))?,
            sku: record.text("sku")?,
            name: record.text("name")?,
            price: Money::from_cents(record.int("price_cents")?)
                .map_err(|e| MappingError::invalid("price_cents", e))?,
            in_stock: record.bool("in_stock")?,
            tags: record.decode("tags")?,
            attributes: record.json("attributes")?,
            created_at: record.timestamp("created_at")?,
            discontinued_at: record.opt_timestamp("discontinued_at")?,
        };
        Ok(Product::restore(state, record.version))
    }
}
