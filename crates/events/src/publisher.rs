//! Post-commit event publication.
//!
//! The publisher is constructed with its handlers and a failure sink; there is
//! no global registry. Each handler invocation runs in its own tokio task so a
//! panic, an error or (with a configured timeout) a hang is contained and
//! reported instead of reaching the caller.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::handler::EventHandler;

/// Publisher configuration.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    /// Upper bound for a single handler invocation. `None` waits indefinitely.
    pub handler_timeout: Option<Duration>,
}

impl PublisherConfig {
    /// Read `KEYSTONE_HANDLER_TIMEOUT_MS`; unset or unparsable means no timeout.
    pub fn from_env() -> Self {
        let handler_timeout = std::env::var("KEYSTONE_HANDLER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        Self { handler_timeout }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// How a handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("error: {0}")]
    Error(String),

    #[error("panicked: {0}")]
    Panic(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One failed handler invocation. Reported out of band, never returned to the
/// code that committed the write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler `{handler}` failed on `{event_type}` ({event_id}): {kind}")]
pub struct EventHandlerError {
    pub handler: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub kind: FailureKind,
}

/// Receives handler failures.
pub trait FailureSink: Send + Sync {
    fn report(&self, failure: &EventHandlerError);
}

/// Default sink: logs each failure at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailureSink;

impl FailureSink for LogFailureSink {
    fn report(&self, failure: &EventHandlerError) {
        tracing::error!(
            handler = %failure.handler,
            event_id = %failure.event_id,
            event_type = %failure.event_type,
            error = %failure.kind,
            "event handler failed"
        );
    }
}

/// Forwards failures to a tokio channel (e.g. a retry or dead-letter worker).
#[derive(Debug, Clone)]
pub struct ChannelFailureSink {
    tx: mpsc::UnboundedSender<EventHandlerError>,
}

impl ChannelFailureSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EventHandlerError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FailureSink for ChannelFailureSink {
    fn report(&self, failure: &EventHandlerError) {
        // Receiver gone: nobody is listening any more; fall back to the log.
        if self.tx.send(failure.clone()).is_err() {
            LogFailureSink.report(failure);
        }
    }
}

/// Keeps failures in memory.
#[derive(Debug, Default)]
pub struct CollectingFailureSink {
    failures: Mutex<Vec<EventHandlerError>>,
}

impl CollectingFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<EventHandlerError> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl FailureSink for CollectingFailureSink {
    fn report(&self, failure: &EventHandlerError) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure.clone());
    }
}

/// Outcome of one publication run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Events dispatched.
    pub published: usize,
    /// Successful handler invocations.
    pub delivered: usize,
    pub failures: Vec<EventHandlerError>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Dispatches envelopes to handlers in registration order.
pub struct EventPublisher {
    handlers: Vec<Arc<dyn EventHandler>>,
    sink: Arc<dyn FailureSink>,
    config: PublisherConfig,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("EventPublisher")
            .field("handlers", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl EventPublisher {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self {
            handlers,
            sink: Arc::new(LogFailureSink),
            config: PublisherConfig::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub async fn publish(&self, event: &EventEnvelope) -> PublishReport {
        let mut report = PublishReport::default();
        self.deliver(event, &mut report).await;
        report
    }

    /// Publish in iteration order; each event reaches every interested handler
    /// before the next event is dispatched.
    pub async fn publish_all<I>(&self, events: I) -> PublishReport
    where
        I: IntoIterator<Item = EventEnvelope>,
    {
        let mut report = PublishReport::default();
        for event in events {
            self.deliver(&event, &mut report).await;
        }
        report
    }

    async fn deliver(&self, event: &EventEnvelope, report: &mut PublishReport) {
        report.published += 1;

        for handler in self.handlers.iter().filter(|h| h.handles(event.event_type())) {
            match self.run_isolated(Arc::clone(handler), event.clone()).await {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::debug!(
                        handler = handler.name(),
                        event_type = event.event_type(),
                        sequence = event.sequence(),
                        "event delivered"
                    );
                }
                Err(kind) => {
                    let failure = EventHandlerError {
                        handler: handler.name().to_string(),
                        event_id: event.event_id(),
                        event_type: event.event_type().to_string(),
                        kind,
                    };
                    self.sink.report(&failure);
                    report.failures.push(failure);
                }
            }
        }
    }

    async fn run_isolated(
        &self,
        handler: Arc<dyn EventHandler>,
        event: EventEnvelope,
    ) -> Result<(), FailureKind> {
        let task = tokio::spawn(async move { handler.handle(&event).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => {
                let abort = task.abort_handle();
                match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        return Err(FailureKind::Timeout(limit));
                    }
                }
            }
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FailureKind::Error(format!("{err:#}"))),
            Err(err) if err.is_panic() => Err(FailureKind::Panic(panic_message(err.into_panic()))),
            Err(err) => Err(FailureKind::Error(err.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DomainEvent;
    use crate::handler::FnHandler;
    use chrono::{DateTime, Utc};
    use keystone_core::AggregateId;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Pinged {
        id: AggregateId,
        at: DateTime<Utc>,
    }

    impl DomainEvent for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }

        fn aggregate_id(&self) -> AggregateId {
            self.id
        }

        fn aggregate_type(&self) -> &'static str {
            "test"
        }
    }

    struct Broken(&'static str);

    #[async_trait::async_trait]
    impl EventHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!(self.0)
        }
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl EventHandler for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            panic!("kaboom")
        }
    }

    fn envelope(sequence: u64) -> EventEnvelope {
        let event = Pinged {
            id: AggregateId::new(),
            at: Utc::now(),
        };
        EventEnvelope::from_event(&event, sequence).unwrap()
    }

    fn recorder(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
        let label = name.to_string();
        Arc::new(FnHandler::new(name, move |event: EventEnvelope| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                log.lock().unwrap().push(format!("{label}:{}", event.sequence()));
                anyhow::Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let publisher = EventPublisher::new(vec![
            recorder("first", Arc::clone(&log)),
            recorder("second", Arc::clone(&log)),
        ]);

        let report = publisher.publish_all([envelope(0), envelope(1)]).await;

        assert!(report.is_clean());
        assert_eq!(report.published, 2);
        assert_eq!(report.delivered, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:0", "second:0", "first:1", "second:1"]
        );
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(CollectingFailureSink::new());
        let publisher = EventPublisher::new(vec![
            Arc::new(Broken("boom")) as Arc<dyn EventHandler>,
            Arc::new(Panicky),
            recorder("healthy", Arc::clone(&log)),
        ])
        .with_sink(sink.clone());

        let report = publisher.publish(&envelope(7)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["healthy:7"]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].kind, FailureKind::Error("boom".into()));
        assert_eq!(report.failures[1].kind, FailureKind::Panic("kaboom".into()));
        assert_eq!(sink.failures(), report.failures);
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let slow: Arc<dyn EventHandler> = Arc::new(FnHandler::new("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(())
        }));
        let publisher = EventPublisher::new(vec![slow])
            .with_config(PublisherConfig::default().with_handler_timeout(Duration::from_millis(20)));

        let report = publisher.publish(&envelope(0)).await;

        assert_eq!(
            report.failures[0].kind,
            FailureKind::Timeout(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn filtered_handlers_skip_other_event_types() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let handler = FnHandler::new("only-other", move |_| {
            let log = Arc::clone(&log_clone);
            async move {
                log.lock().unwrap().push("called".to_string());
                anyhow::Ok(())
            }
        })
        .for_types(["other.event"]);
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let publisher = EventPublisher::new(vec![handler]);

        let report = publisher.publish(&envelope(0)).await;

        assert_eq!(report.delivered, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_sink_forwards_failures() {
        let (sink, mut rx) = ChannelFailureSink::channel();
        let publisher = EventPublisher::new(vec![Arc::new(Broken("nope")) as Arc<dyn EventHandler>])
            .with_sink(Arc::new(sink));

        publisher.publish(&envelope(0)).await;

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.handler, "broken");
        assert_eq!(failure.event_type, "test.pinged");
    }
}
