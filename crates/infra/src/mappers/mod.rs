//! Mappers for the sample aggregates.

mod order;
mod product;

pub use order::OrderMapper;
pub use product::ProductMapper;
