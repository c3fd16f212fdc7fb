//! Domain events: recording on aggregates, envelopes, handlers and publication.
//!
//! Aggregates record events in an [`EventBuffer`]. Repositories drain the buffer
//! into the unit of work, which wraps each event in an [`EventEnvelope`] and, only
//! after the transaction commits, hands the envelopes to an [`EventPublisher`].

pub mod bus;
pub mod collector;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod publisher;

pub use bus::{EventBus, Subscription};
pub use collector::{EventBuffer, EventSource};
pub use envelope::EventEnvelope;
pub use event::DomainEvent;
pub use handler::{EventHandler, FnHandler};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use publisher::{
    ChannelFailureSink, CollectingFailureSink, EventHandlerError, EventPublisher, FailureKind,
    FailureSink, LogFailureSink, PublishReport, PublisherConfig,
};
