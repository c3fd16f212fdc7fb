//! Entity trait: identity + continuity across state changes.

/// Identity of an entity.
///
/// Identities are opaque and immutable once assigned. A transient entity may
/// carry the *unassigned* identity until a repository persists it.
pub trait Identity:
    Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display + Send + Sync + 'static
{
    /// Generate a fresh identity.
    fn generate() -> Self;

    /// The placeholder identity of an entity that has not been persisted yet.
    fn unassigned() -> Self;

    fn is_unassigned(&self) -> bool {
        *self == Self::unassigned()
    }
}

/// Entity marker + minimal interface.
///
/// Two entities are the same entity when their identities are equal, regardless
/// of the rest of their state.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Identity;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Assign an identity to a transient entity.
    ///
    /// Only meaningful while `id().is_unassigned()`; repositories call this from
    /// `add` and never touch an assigned identity.
    fn assign_id(&mut self, id: Self::Id);

    fn same_identity_as(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
