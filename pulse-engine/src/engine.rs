//! The `SyncEngine` facade.
//!
//! Owns one instance of every component and wires them together. Views talk
//! to the engine only through [`SyncEngine::query`] and
//! [`SyncEngine::mutation`]; everything else is for the host application
//! and tests.

use crate::clock::{Clock, TokioClock};
use crate::dispatch::{FetchDispatcher, FetchMode, QueryFetcher, SharedFetch};
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::mutation::{MutationCoordinator, MutationIntent, OptimisticMutation, QueryMutator};
use crate::registry::{Released, SubscriptionId, SubscriptionRegistry};
use crate::scheduler::Scheduler;
use crate::store::{CacheStore, Listener};
use crate::view::{MutationHandle, QueryHandle};
use pulse_core::{
    CacheKey, EngineConfig, EngineError, FetchError, KeyCodec, PulseResult, QueryEntry, QueryOptions,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<CacheStore>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) dispatcher: Arc<FetchDispatcher>,
    pub(crate) scheduler: Scheduler,
    pub(crate) mutations: Arc<MutationCoordinator>,
    pub(crate) metrics: Arc<EngineMetrics>,
    shut_down: AtomicBool,
}

impl EngineInner {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Tear down one subscription and arm the eviction timer if it was the
    /// key's last.
    pub(crate) fn release(self: &Arc<Self>, id: SubscriptionId) {
        self.scheduler.stop(id);
        self.store.unwatch(id);
        let Some(released) = self.registry.unsubscribe(id) else {
            return;
        };

        tracing::trace!(subscription = %id, key = %released.key, "Last subscriber left");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let this = Arc::clone(self);
                let grace = self.config.gc_grace();
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    // A response still on its way lands before the key can go.
                    while let Some(running) = this.running_fetch(&released.key) {
                        let _ = running.await;
                    }
                    this.collect(&released);
                });
            }
            // Dropped outside a runtime: nothing can tick the grace timer.
            Err(_) => self.collect(&released),
        }
    }

    fn running_fetch(&self, key: &CacheKey) -> Option<SharedFetch> {
        let request_id = self.store.get(key)?.in_flight_request_id?;
        self.dispatcher.running(request_id)
    }

    /// Evict a released key unless it was resubscribed in the meantime.
    fn collect(&self, released: &Released) {
        if !self.registry.is_idle_since(&released.key, released.generation) {
            return;
        }
        if self.store.evict(&released.key) {
            EngineMetrics::incr(&self.metrics.evictions);
        }
        self.registry.forget(&released.key);
    }
}

/// Live data synchronization engine.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine on the tokio clock.
    pub fn new(config: EngineConfig) -> PulseResult<Self> {
        Self::with_clock(config, Arc::new(TokioClock::new()))
    }

    /// Create an engine with an explicit clock.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> PulseResult<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let store = Arc::new(CacheStore::new(clock));
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(FetchDispatcher::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&metrics),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.jitter_ratio,
        );
        let mutations = Arc::new(MutationCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry,
                dispatcher,
                scheduler,
                mutations,
                metrics,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn register_fetcher(&self, entity: impl Into<String>, fetcher: Arc<dyn QueryFetcher>) {
        self.inner.dispatcher.register(entity, fetcher);
    }

    /// Fetcher for every entity without one of its own.
    pub fn register_fallback_fetcher(&self, fetcher: Arc<dyn QueryFetcher>) {
        self.inner.dispatcher.register_fallback(fetcher);
    }

    pub fn register_mutator(&self, entity: impl Into<String>, mutator: Arc<dyn QueryMutator>) {
        self.inner.mutations.register_mutator(entity, mutator);
    }

    /// Start an [`OptimisticMutation`] against the mutator registered for
    /// `entity`.
    pub fn optimistic(&self, entity: &str, payload: Value) -> Result<OptimisticMutation, FetchError> {
        let mutator = self.inner.mutations.mutator_for(entity)?;
        Ok(OptimisticMutation::new(mutator, entity, payload))
    }

    /// Mount a query for a view.
    ///
    /// Subscribes, serves whatever is cached, starts a deduplicated fetch if
    /// the entry is missing or stale and, for polled queries, starts the
    /// scheduler. Dropping the handle unsubscribes.
    pub fn query(&self, entity: &str, params: &Value, options: QueryOptions) -> PulseResult<QueryHandle> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown.into());
        }

        let key = KeyCodec::encode(entity, params)?;
        let (interval, stale_after) = self.inner.config.resolve(entity, &options);
        let view = options.view.clone().unwrap_or_else(|| entity.to_string());

        let id = self.inner.registry.subscribe(view.as_str(), key.clone(), interval);
        let entry = self.inner.store.ensure(&key, stale_after);

        let (changes_tx, changes_rx) = watch::channel(self.inner.store.version(&key));
        let listener: Listener = Arc::new(move |version| {
            changes_tx.send_replace(version);
        });
        self.inner.store.watch(id, &key, listener);

        let now = self.inner.store.clock().now();
        if entry.is_stale(now) {
            drop(self.inner.dispatcher.fetch(&key, FetchMode::Deduplicate));
        }
        if let Some(interval) = interval {
            self.inner.scheduler.start(id, key.clone(), interval);
        }

        tracing::debug!(
            subscription = %id,
            view = %view,
            key = %key,
            interval_ms = interval.map(|i| i.as_millis() as u64),
            "Query mounted"
        );

        Ok(QueryHandle::new(Arc::clone(&self.inner), id, key, changes_rx))
    }

    /// Toggle pause-on-interaction for a subscription.
    pub fn set_interacting(&self, subscription: SubscriptionId, interacting: bool) -> PulseResult<()> {
        if self.inner.registry.set_paused(subscription, interacting) {
            tracing::trace!(subscription = %subscription, interacting, "Interaction toggled");
            Ok(())
        } else {
            Err(EngineError::SubscriptionNotFound {
                subscription_id: subscription.as_uuid(),
            }
            .into())
        }
    }

    /// Bind a mutation factory for a view's action handlers.
    pub fn mutation<In, I, F>(&self, factory: F) -> MutationHandle<In>
    where
        I: MutationIntent + 'static,
        F: Fn(In) -> I + Send + Sync + 'static,
    {
        MutationHandle::new(Arc::clone(&self.inner), factory)
    }

    /// Run one intent directly.
    pub async fn run_mutation(&self, intent: &dyn MutationIntent) -> Result<Value, FetchError> {
        self.inner.mutations.run(intent).await
    }

    /// Fetch a key outside any subscription.
    pub async fn fetch(&self, key: &CacheKey, mode: FetchMode) -> Result<Value, FetchError> {
        self.inner.dispatcher.fetch(key, mode).await
    }

    pub fn get(&self, key: &CacheKey) -> Option<QueryEntry> {
        self.inner.store.get(key)
    }

    /// Mark one query stale. See [`CacheStore::invalidate`].
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.store.invalidate(key)
    }

    pub fn invalidate_entity(&self, entity: &str) -> usize {
        self.inner.store.invalidate_entity(entity)
    }

    /// Every cached entry, sorted by key.
    pub fn entries(&self) -> Vec<(CacheKey, QueryEntry)> {
        self.inner.store.snapshot()
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> u32 {
        self.inner.registry.count_subscribers(key)
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop all scheduling and refuse new work. Outstanding fetches finish.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.scheduler.shutdown();
        self.inner.dispatcher.close();

        let snapshot = self.inner.metrics.snapshot();
        tracing::info!(
            network_calls = snapshot.network_calls,
            deduplicated = snapshot.deduplicated,
            retries = snapshot.retries,
            fetch_failures = snapshot.fetch_failures,
            mutations_confirmed = snapshot.mutations_confirmed,
            mutations_rolled_back = snapshot.mutations_rolled_back,
            evictions = snapshot.evictions,
            "Sync engine shut down"
        );
    }
}
