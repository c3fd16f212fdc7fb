use chrono::{DateTime, Utc};
use serde::Serialize;

use keystone_core::AggregateId;

/// A fact recorded by an aggregate.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **tagged** with the aggregate that raised them
///
/// Only aggregate methods create events; everything downstream reads them.
pub trait DomainEvent: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Stable event name (e.g. "sales.order.placed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Identity of the originating aggregate.
    fn aggregate_id(&self) -> AggregateId;

    /// Kind of the originating aggregate (e.g. "sales.order").
    fn aggregate_type(&self) -> &'static str;
}
