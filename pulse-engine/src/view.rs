//! Handles given to views.
//!
//! A [`QueryHandle`] is one mounted query: reading it never blocks and
//! dropping it unsubscribes. A [`MutationHandle`] binds an intent factory to
//! a view's action handlers.

use crate::dispatch::FetchMode;
use crate::engine::EngineInner;
use crate::mutation::{MutationIntent, MutationState};
use crate::registry::SubscriptionId;
use pulse_core::{
    CacheKey, EngineError, ErrorRecord, FetchError, PulseError, PulseResult, QueryEntry, QueryStatus,
    Timestamp,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// What a view should render for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// No data yet and no failure: show a loading placeholder.
    Loading,
    /// Fresh data.
    Ready,
    /// Data is shown with a "may be out of date" indicator.
    ReadyStale,
    /// No data and the last fetch failed: show an error with a retry action.
    Failed,
}

/// Point-in-time view of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<ErrorRecord>,
    pub is_stale: bool,
    pub fetched_at: Option<Timestamp>,
}

impl QuerySnapshot {
    fn from_entry(entry: &QueryEntry, now: Timestamp) -> Self {
        Self {
            data: entry.data.clone(),
            status: entry.status,
            error: entry.error.clone(),
            is_stale: entry.is_stale(now),
            fetched_at: entry.fetched_at,
        }
    }

    fn loading() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_stale: true,
            fetched_at: None,
        }
    }

    pub fn view_state(&self) -> ViewState {
        match (&self.data, &self.error) {
            (None, Some(_)) => ViewState::Failed,
            (None, None) => ViewState::Loading,
            (Some(_), Some(_)) => ViewState::ReadyStale,
            (Some(_), None) if self.is_stale => ViewState::ReadyStale,
            (Some(_), None) => ViewState::Ready,
        }
    }
}

/// One mounted query.
pub struct QueryHandle {
    engine: Arc<EngineInner>,
    id: SubscriptionId,
    key: CacheKey,
    changes: watch::Receiver<u64>,
}

impl QueryHandle {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        id: SubscriptionId,
        key: CacheKey,
        changes: watch::Receiver<u64>,
    ) -> Self {
        Self {
            engine,
            id,
            key,
            changes,
        }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the query. Never blocks on I/O.
    pub fn snapshot(&self) -> QuerySnapshot {
        let now = self.engine.store.clock().now();
        match self.engine.store.get(&self.key) {
            Some(entry) => QuerySnapshot::from_entry(&entry, now),
            None => QuerySnapshot::loading(),
        }
    }

    /// Deserialize the cached data. `Ok(None)` when nothing is cached yet.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.engine
            .store
            .get(&self.key)
            .and_then(|entry| entry.data)
            .map(serde_json::from_value)
            .transpose()
    }

    /// Manual refresh. Joins a fetch already in flight for this key.
    pub async fn refetch(&self) -> Result<Value, FetchError> {
        self.refetch_with(FetchMode::Deduplicate).await
    }

    pub async fn refetch_with(&self, mode: FetchMode) -> Result<Value, FetchError> {
        self.engine.dispatcher.fetch(&self.key, mode).await
    }

    /// Pause background refresh while the user inspects this view.
    /// Takes effect on the next tick; an in-flight fetch is not cancelled.
    pub fn set_interacting(&self, interacting: bool) {
        self.engine.registry.set_paused(self.id, interacting);
    }

    pub fn is_interacting(&self) -> bool {
        self.engine.registry.is_paused(self.id).unwrap_or(false)
    }

    /// Wait for the next change to this query's entry and return its version.
    pub async fn changed(&mut self) -> PulseResult<u64> {
        self.changes
            .changed()
            .await
            .map_err(|_| PulseError::from(EngineError::ShutDown))?;
        Ok(*self.changes.borrow_and_update())
    }

    /// Unmount explicitly. Same as dropping the handle.
    pub fn dispose(self) {}
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.engine.release(self.id);
    }
}

type IntentFactory<In> = dyn Fn(In) -> Box<dyn MutationIntent> + Send + Sync;

/// A mutation bound to a view's action handler.
pub struct MutationHandle<In> {
    engine: Arc<EngineInner>,
    factory: Arc<IntentFactory<In>>,
    state: Arc<watch::Sender<MutationState>>,
}

impl<In> Clone for MutationHandle<In> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            factory: Arc::clone(&self.factory),
            state: Arc::clone(&self.state),
        }
    }
}

impl<In> MutationHandle<In> {
    pub(crate) fn new<I, F>(engine: Arc<EngineInner>, factory: F) -> Self
    where
        I: MutationIntent + 'static,
        F: Fn(In) -> I + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(MutationState::Pending);
        Self {
            engine,
            factory: Arc::new(move |input| Box::new(factory(input)) as Box<dyn MutationIntent>),
            state: Arc::new(state),
        }
    }

    /// State of the most recent `mutate` call.
    pub fn state(&self) -> MutationState {
        *self.state.borrow()
    }

    /// Observe state transitions of this handle's mutations.
    pub fn watch_state(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    /// Run the mutation built from `input`.
    ///
    /// Runs on its own task, so dropping the returned future does not stop a
    /// rollback. The commit error is returned for user-facing reporting.
    pub async fn mutate(&self, input: In) -> Result<Value, FetchError> {
        if self.engine.is_shut_down() {
            return Err(FetchError::Aborted {
                reason: "engine shut down".to_string(),
            });
        }

        let intent = (self.factory)(input);
        let coordinator = Arc::clone(&self.engine.mutations);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move { coordinator.execute(intent.as_ref(), &state).await });

        match task.await {
            Ok(result) => result,
            Err(join_error) => Err(FetchError::Aborted {
                reason: join_error.to_string(),
            }),
        }
    }
}
