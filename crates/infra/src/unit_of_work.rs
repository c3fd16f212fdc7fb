//! Unit of Work: one transaction, one event queue, one commit.
//!
//! ```text
//! begin ─▶ repositories write through the transaction
//!            │      └─ drained aggregate events queue up (FIFO)
//!            ▼
//!         commit ─▶ transaction commits ─▶ queued events published
//!            │
//!            └─ failure / rollback / drop ─▶ transaction rolled back, events discarded
//! ```
//!
//! Events are only published after the store acknowledged the commit, so a
//! handler never observes a write that was rolled back. Handler failures are
//! reported in the [`CommitReport`] and never undo the commit.
//!
//! ## States
//!
//! `NotStarted → Active → Committed | RolledBack`. Terminal states are final:
//! a unit of work is used for exactly one logical operation.
//!
//! ## Drop
//!
//! Dropping the last handle to an active unit of work (early return, panic,
//! cancelled future) drops the transaction, which the store rolls back, and
//! discards the queued events.

use std::future::Future;
use std::sync::{Arc, Mutex};

use keystone_events::{DomainEvent, EventEnvelope, EventHandlerError, EventPublisher, PublishReport};

use crate::error::{RepositoryError, RepositoryResult};
use crate::mapper::EntityMapper;
use crate::repository::{QueryStats, StoreRepository};
use crate::store::{Store, Transaction};

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnitOfWorkState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Events dispatched to the publisher.
    pub published: usize,
    /// Successful handler invocations.
    pub delivered: usize,
    pub handler_failures: Vec<EventHandlerError>,
}

impl From<PublishReport> for CommitReport {
    fn from(report: PublishReport) -> Self {
        Self {
            published: report.published,
            delivered: report.delivered,
            handler_failures: report.failures,
        }
    }
}

#[derive(Debug, Default)]
struct EventQueue {
    next_sequence: u64,
    envelopes: Vec<EventEnvelope>,
}

/// Transaction and event queue shared by a unit of work and its repositories.
///
/// The transaction slot is emptied when the unit of work ends; repository
/// calls made after that fail with `InvalidState`.
pub(crate) struct Session<Tx> {
    tx: tokio::sync::Mutex<Option<Tx>>,
    queue: Mutex<EventQueue>,
}

impl<Tx: Transaction> Session<Tx> {
    fn new(tx: Tx) -> Self {
        Self {
            tx: tokio::sync::Mutex::new(Some(tx)),
            queue: Mutex::new(EventQueue::default()),
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<Tx>> {
        self.tx.lock().await
    }

    /// The open transaction in a locked slot.
    pub(crate) fn active(slot: &mut Option<Tx>) -> RepositoryResult<&mut Tx> {
        slot.as_mut()
            .ok_or_else(|| RepositoryError::InvalidState("unit of work is no longer active".to_string()))
    }

    /// Wrap `events` and append them to the queue in order.
    pub(crate) fn enqueue<E: DomainEvent>(&self, events: Vec<E>) -> RepositoryResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| RepositoryError::persistence("event queue lock poisoned"))?;
        for event in &events {
            queue.next_sequence += 1;
            let envelope = EventEnvelope::from_event(event, queue.next_sequence)?;
            queue.envelopes.push(envelope);
        }
        Ok(())
    }

    fn pending(&self) -> Vec<EventEnvelope> {
        self.queue
            .lock()
            .map(|q| q.envelopes.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().envelopes.clone())
    }

    fn drain(&self) -> Vec<EventEnvelope> {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut queue.envelopes)
    }

    async fn take_tx(&self) -> Option<Tx> {
        self.tx.lock().await.take()
    }
}

struct Inner<S: Store> {
    store: Arc<S>,
    publisher: Arc<EventPublisher>,
    stats: Arc<QueryStats>,
    state: Mutex<UnitOfWorkState>,
    session: Mutex<Option<Arc<Session<S::Tx>>>>,
}

impl<S: Store> Drop for Inner<S> {
    fn drop(&mut self) {
        let state = *self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state != UnitOfWorkState::Active {
            return;
        }
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(session) = session {
            // A busy slot means a repository call is in flight elsewhere; the
            // transaction then rolls back when that session is dropped.
            if let Ok(mut slot) = session.tx.try_lock() {
                slot.take();
            }
            let discarded = session.drain().len();
            tracing::debug!(discarded, "active unit of work dropped; rolled back");
        }
    }
}

/// Transaction boundary plus post-commit event publication.
///
/// Cheap to clone; clones share state. Use a fresh instance per logical
/// operation, usually through [`UnitOfWorkFactory::scope`].
pub struct UnitOfWork<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for UnitOfWork<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> core::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<S: Store> UnitOfWork<S> {
    fn new(store: Arc<S>, publisher: Arc<EventPublisher>, stats: Arc<QueryStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                publisher,
                stats,
                state: Mutex::new(UnitOfWorkState::NotStarted),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> UnitOfWorkState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: UnitOfWorkState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn require(&self, expected: UnitOfWorkState, operation: &str) -> RepositoryResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(RepositoryError::InvalidState(format!(
                "cannot {operation} a unit of work in state {state:?}"
            )))
        }
    }

    fn session(&self, operation: &str) -> RepositoryResult<Arc<Session<S::Tx>>> {
        self.require(UnitOfWorkState::Active, operation)?;
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| RepositoryError::InvalidState(format!("cannot {operation}: no open transaction")))
    }

    fn end_session(&self) -> Option<Arc<Session<S::Tx>>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Open the transaction.
    #[tracing::instrument(skip(self), err)]
    pub async fn begin(&self) -> RepositoryResult<()> {
        self.require(UnitOfWorkState::NotStarted, "begin")?;
        let tx = self.inner.store.begin().await?;

        let mut state = self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != UnitOfWorkState::NotStarted {
            return Err(RepositoryError::InvalidState(format!(
                "cannot begin a unit of work in state {:?}",
                *state
            )));
        }
        *self
            .inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(Session::new(tx)));
        *state = UnitOfWorkState::Active;
        tracing::debug!("unit of work started");
        Ok(())
    }

    /// Repository for `mapper`'s entity bound to this unit of work's transaction.
    pub fn repository<M: EntityMapper>(&self, mapper: M) -> RepositoryResult<StoreRepository<S::Tx, M>> {
        let session = self.session("open a repository on")?;
        Ok(StoreRepository::new(session, mapper, Arc::clone(&self.inner.stats)))
    }

    /// [`UnitOfWork::repository`] with a default-constructed mapper.
    pub fn get_repository<M: EntityMapper + Default>(&self) -> RepositoryResult<StoreRepository<S::Tx, M>> {
        self.repository(M::default())
    }

    /// Events queued so far, in publication order.
    pub fn pending_events(&self) -> Vec<EventEnvelope> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|s| s.pending())
            .unwrap_or_default()
    }

    /// Commit the transaction, then publish the queued events in FIFO order.
    ///
    /// A failed commit leaves the unit of work rolled back with its events
    /// discarded and returns the store error.
    #[tracing::instrument(skip(self), err)]
    pub async fn commit(&self) -> RepositoryResult<CommitReport> {
        let session = self.session("commit")?;
        let tx = session
            .take_tx()
            .await
            .ok_or_else(|| RepositoryError::InvalidState("transaction already finished".to_string()))?;
        self.end_session();

        if let Err(err) = tx.commit().await {
            let discarded = session.drain().len();
            self.set_state(UnitOfWorkState::RolledBack);
            tracing::warn!(error = %err, discarded, "commit failed; unit of work rolled back");
            return Err(err);
        }

        let events = session.drain();
        self.set_state(UnitOfWorkState::Committed);
        let report = CommitReport::from(self.inner.publisher.publish_all(events).await);
        tracing::info!(
            published = report.published,
            delivered = report.delivered,
            handler_failures = report.handler_failures.len(),
            "unit of work committed"
        );
        Ok(report)
    }

    /// Roll back the transaction and discard queued events.
    #[tracing::instrument(skip(self), err)]
    pub async fn rollback(&self) -> RepositoryResult<()> {
        let session = self.session("roll back")?;
        let tx = session.take_tx().await;
        self.end_session();
        let discarded = session.drain().len();
        self.set_state(UnitOfWorkState::RolledBack);
        tracing::debug!(discarded, "unit of work rolled back");

        match tx {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

/// Creates units of work over one store and one publisher.
pub struct UnitOfWorkFactory<S: Store> {
    store: Arc<S>,
    publisher: Arc<EventPublisher>,
    stats: Arc<QueryStats>,
}

impl<S: Store> Clone for UnitOfWorkFactory<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            publisher: Arc::clone(&self.publisher),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: Store> UnitOfWorkFactory<S> {
    pub fn new(store: S, publisher: EventPublisher) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(publisher))
    }

    pub fn from_shared(store: Arc<S>, publisher: Arc<EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            stats: Arc::new(QueryStats::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Query counters shared by every repository this factory hands out.
    pub fn stats(&self) -> &Arc<QueryStats> {
        &self.stats
    }

    /// A unit of work in state `NotStarted`.
    pub fn create(&self) -> UnitOfWork<S> {
        UnitOfWork::new(
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
            Arc::clone(&self.stats),
        )
    }

    /// A unit of work in state `Active`.
    pub async fn begin(&self) -> RepositoryResult<UnitOfWork<S>> {
        let uow = self.create();
        uow.begin().await?;
        Ok(uow)
    }

    /// Run `work` inside a fresh unit of work.
    ///
    /// `Ok` commits (unless `work` already ended the unit of work itself);
    /// `Err` rolls back and returns the error unchanged.
    pub async fn scope<F, Fut, T, Err>(&self, work: F) -> Result<T, Err>
    where
        F: FnOnce(UnitOfWork<S>) -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<RepositoryError>,
    {
        let uow = self.begin().await?;
        match work(uow.clone()).await {
            Ok(value) => {
                if uow.state() == UnitOfWorkState::Active {
                    uow.commit().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if uow.state() == UnitOfWorkState::Active
                    && let Err(rollback_err) = uow.rollback().await
                {
                    tracing::warn!(error = %rollback_err, "rollback after failed scope also failed");
                }
                Err(err)
            }
        }
    }
}
