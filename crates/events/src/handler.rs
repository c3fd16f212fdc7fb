//! Event handler abstraction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::EventEnvelope;

/// Reacts to published events.
///
/// Handlers run after the originating transaction committed, so they cannot
/// veto the write. Returning an error only produces a failure report.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Whether this handler wants events of `event_type`. Defaults to all.
    fn handles(&self, _event_type: &str) -> bool {
        true
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn handles(&self, event_type: &str) -> bool {
        (**self).handles(event_type)
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Closure-backed handler, optionally filtered to a set of event types.
pub struct FnHandler {
    name: String,
    event_types: Option<Vec<String>>,
    func: Box<dyn Fn(EventEnvelope) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            event_types: None,
            func: Box::new(move |event| Box::pin(func(event))),
        }
    }

    /// Restrict the handler to the given event types.
    pub fn for_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }
}

impl core::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .finish()
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event_type: &str) -> bool {
        match &self.event_types {
            Some(types) => types.iter().any(|t| t == event_type),
            None => true,
        }
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        (self.func)(event.clone()).await
    }
}
