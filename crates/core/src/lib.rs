//! `keystone-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! entities, aggregates, value objects, identifiers, attribute values, the
//! specification algebra and declarative validation rules.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod rules;
pub mod specification;
pub mod value;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::{Entity, Identity};
pub use error::{DomainError, DomainResult};
pub use id::AggregateId;
pub use rules::{Rule, RuleSet};
pub use specification::{
    Criterion, DateWindow, PredicateSpec, Spec, Specification, TextMatch,
};
pub use value::{Attributes, Value};
pub use value_object::ValueObject;
