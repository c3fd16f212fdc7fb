use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keystone_core::AggregateId;

use crate::event::DomainEvent;

/// Type-erased event as it travels from a unit of work to handlers.
///
/// - `sequence` is the enqueue position within the unit of work that produced it;
///   handlers observe envelopes in that order.
/// - `payload` is the serialized domain event; typed handlers call [`EventEnvelope::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    sequence: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn from_event<E: DomainEvent>(event: &E, sequence: u64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::now_v7(),
            aggregate_id: event.aggregate_id(),
            aggregate_type: event.aggregate_type().to_string(),
            sequence,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload: serde_json::to_value(event)?,
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}
