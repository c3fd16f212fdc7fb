//! Products domain module.
//!
//! Catalog products as a state-stored aggregate: the repository persists the
//! current state and the recorded events are published after commit.

pub mod money;
pub mod product;

pub use money::Money;
pub use product::{
    Product, ProductAttributesChanged, ProductCreated, ProductDiscontinued, ProductEvent,
    ProductId, ProductPriceChanged, ProductState, ProductStockChanged, ProductTagged,
};
