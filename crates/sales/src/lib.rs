//! Sales orders domain module.
//!
//! Business rules for orders and their lines, implemented as deterministic
//! domain logic (no IO, no storage).

pub mod order;

pub use order::{
    LineAdded, LineRemoved, Order, OrderCancelled, OrderCreated, OrderEvent, OrderId, OrderLine,
    OrderPlaced, OrderState, OrderStatus,
};
