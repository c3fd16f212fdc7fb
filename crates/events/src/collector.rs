//! Per-aggregate pending event buffer.

use crate::event::DomainEvent;

/// Append-only list of events an aggregate has raised since it was last drained.
#[derive(Debug, Clone)]
pub struct EventBuffer<E> {
    pending: Vec<E>,
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: E) {
        self.pending.push(event);
    }

    pub fn pending(&self) -> &[E] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending event, oldest first. A second call returns nothing.
    pub fn clear_events(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }
}

/// Aggregates that record domain events.
///
/// Repositories drain through this trait on `add`, `update` and `delete`.
pub trait EventSource {
    type Event: DomainEvent;

    fn pending_events(&self) -> &[Self::Event];

    fn clear_events(&mut self) -> Vec<Self::Event>;
}
