//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have **no identity**: two value objects with the same attribute
/// values are equal. They are immutable; to "modify" one, build a new one.
///
/// Value objects validate themselves at construction, so a constructor returns
/// `DomainResult<Self>` and an existing instance is always valid:
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Money { cents: i64, currency: String }
///
/// impl Money {
///     pub fn new(cents: i64, currency: &str) -> DomainResult<Self> {
///         if cents < 0 {
///             return Err(DomainError::validation("amount must not be negative"));
///         }
///         Ok(Self { cents, currency: currency.to_string() })
///     }
/// }
///
/// impl ValueObject for Money {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
