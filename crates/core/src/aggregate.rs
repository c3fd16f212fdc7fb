//! Aggregate root traits for event-recording domain models.

use crate::entity::Entity;

/// Aggregate root: the only externally addressable object of its cluster.
///
/// All consistency rules spanning the cluster are enforced inside root methods.
/// The version is the *persistence* version: `0` for an aggregate that was never
/// stored, then bumped by the repository on every successful write.
pub trait AggregateRoot: Entity {
    /// Monotonically increasing version of the persisted state.
    fn version(&self) -> u64;

    /// Record the version the store now holds.
    ///
    /// Repositories call this after `add`/`update`; domain code never should.
    fn set_version(&mut self, version: u64);

    fn is_transient(&self) -> bool {
        self.version() == 0
    }
}

/// Version a write expects to find in the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Write whatever is stored (delete by id).
    Any,
    /// Write only over this persisted version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expect the version `aggregate` was loaded at.
    pub fn of(aggregate: &impl AggregateRoot) -> Self {
        ExpectedVersion::Exact(aggregate.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn exact(self) -> Option<u64> {
        match self {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v),
        }
    }
}

/// State evolution through a closed set of events.
///
/// `Event` is a tagged union and `apply` is one exhaustive `match`, so adding a
/// variant without handling it is a compile error. Mutating root methods build
/// an event, `apply` it and record it in the aggregate's event buffer.
pub trait Aggregate: AggregateRoot + Sized {
    type Event: Clone + core::fmt::Debug;

    /// Evolve in-memory state from a single event. Must be deterministic.
    fn apply(&mut self, event: &Self::Event);

    /// Rebuild state by folding `history` over `initial`.
    fn from_history<'a>(initial: Self, history: impl IntoIterator<Item = &'a Self::Event>) -> Self
    where
        Self::Event: 'a,
    {
        let mut aggregate = initial;
        for event in history {
            aggregate.apply(event);
        }
        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_matches_only_itself() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn any_has_no_exact_version() {
        assert_eq!(ExpectedVersion::Any.exact(), None);
        assert_eq!(ExpectedVersion::Exact(7).exact(), Some(7));
    }
}
