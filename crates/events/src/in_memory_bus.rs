//! In-memory event bus for tests/dev.
//!
//! Subscriptions are `std::sync::mpsc` channels: publishing never blocks and
//! never awaits, so the bus can run inside a publisher's handler task without
//! holding up other handlers.

use std::sync::{Mutex, mpsc};

use async_trait::async_trait;
use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::envelope::EventEnvelope;
use crate::handler::EventHandler;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// A thread panicked while holding the subscriber list.
    #[error("subscriber list lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// Fan-out is best effort: subscriptions whose receiver was dropped are pruned
/// on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered subscriptions. Dropped ones count until the next publish prunes them.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned list still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription::new(rx)
    }
}

/// Registered with an `EventPublisher`, the bus forwards every published
/// envelope to its subscriptions.
#[async_trait]
impl EventHandler for InMemoryEventBus<EventEnvelope> {
    fn name(&self) -> &str {
        "in-memory-bus"
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.publish(event.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscription_gets_every_message() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish("x").unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec!["x"]);
    }
}
