//! Pub/sub distribution of published events (mechanics only).
//!
//! A bus sits behind the publisher: once a unit of work has committed and the
//! publisher dispatches envelopes, a bus registered as a handler copies each one
//! to every live subscription. The bus never stores anything; the committed
//! write is the source of truth.
//!
//! ## Delivery
//!
//! - **After commit only**: nothing reaches a bus for a rolled-back unit of work.
//! - **Broadcast**: every subscription receives its own copy of each message.
//! - **Per-subscription order**: messages arrive in publish order, which for one
//!   unit of work is the envelope `sequence` order.
//! - **No replay**: a subscription only sees messages published after it was
//!   created, and a dropped subscription loses whatever was still queued.
//!
//! Consumers that need durability should read the committed state through a
//! repository instead of relying on the bus.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Receiving end of a bus subscription (broadcast: every subscription sees
/// every message published after it was created, in publish order).
///
/// ```ignore
/// let subscription = bus.subscribe();
/// uow.commit().await?;
/// for envelope in subscription.drain() {
///     audit.record(envelope.event_type(), envelope.sequence());
/// }
/// ```
///
/// A subscription is consumed from one place at a time; receiving methods
/// take `&self` but the underlying channel has a single receiver.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Next message if one is queued, without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout`. `Disconnected` means the bus was dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub.
///
/// ```text
/// UnitOfWork::commit -> EventPublisher -> handlers
///                                           +- EventBus::publish -> subscriptions
/// ```
///
/// A failing `publish` surfaces as a handler failure in the commit report; the
/// committed write is never undone because of it. Implementations are shared
/// across tasks, hence `Send + Sync`.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Hand `message` to every live subscription.
    fn publish(&self, message: M) -> Result<(), Self::Error>;

    /// Start receiving messages published from now on.
    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
