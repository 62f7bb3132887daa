//! Optimistic mutations.
//!
//! A mutation moves through `Pending -> Applied -> Committing` and ends in
//! `Confirmed` or `RolledBack`. Mutations touching the same key run one at a
//! time; each key has its own async lock, taken in key order so two
//! overlapping intents can never wait on each other.

use crate::dispatch::{FetchDispatcher, FetchMode};
use crate::metrics::EngineMetrics;
use crate::store::CacheStore;
use async_trait::async_trait;
use pulse_core::{CacheKey, FetchError, QueryEntry};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{watch, OwnedMutexGuard};

/// Lifecycle state of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationState {
    /// Waiting for overlapping mutations to resolve.
    Pending,
    /// Optimistic values are visible in the store.
    Applied,
    /// The server call is outstanding.
    Committing,
    Confirmed,
    RolledBack,
}

impl MutationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Committing => "committing",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One user action with an optimistic effect on cached queries.
#[async_trait]
pub trait MutationIntent: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str {
        "mutation"
    }

    /// Keys whose entries this mutation patches.
    fn affected_keys(&self) -> Vec<CacheKey>;

    /// Optimistic data for one affected entry, or `None` to leave it alone.
    /// Keys with no cached entry are skipped.
    fn apply(&self, key: &CacheKey, entry: &QueryEntry) -> Option<Value>;

    /// Perform the real mutation against the backend.
    async fn commit(&self) -> Result<Value, FetchError>;

    /// Patch computed from the server's answer. Affected keys are
    /// invalidated afterwards either way.
    fn reconcile(&self, _key: &CacheKey, _entry: &QueryEntry, _server_value: &Value) -> Option<Value> {
        None
    }
}

/// Backend side of a mutation: sends an action payload for an entity.
#[async_trait]
pub trait QueryMutator: Send + Sync {
    async fn mutate(&self, entity: &str, payload: &Value) -> Result<Value, FetchError>;
}

type ApplyFn = dyn Fn(&CacheKey, Option<&Value>) -> Option<Value> + Send + Sync;
type ReconcileFn = dyn Fn(&CacheKey, Option<&Value>, &Value) -> Option<Value> + Send + Sync;

/// A [`MutationIntent`] assembled from closures and a [`QueryMutator`].
///
/// ```ignore
/// let pause = OptimisticMutation::new(mutator, "queue_status", json!({"action": "pause"}))
///     .affecting(queue_key)
///     .with_patch(json!({"paused": true}));
/// engine.mutation(move |_| pause.clone()).mutate(()).await?;
/// ```
#[derive(Clone)]
pub struct OptimisticMutation {
    name: String,
    entity: String,
    payload: Value,
    keys: Vec<CacheKey>,
    mutator: Arc<dyn QueryMutator>,
    apply: Option<Arc<ApplyFn>>,
    reconcile: Option<Arc<ReconcileFn>>,
}

impl OptimisticMutation {
    pub fn new(mutator: Arc<dyn QueryMutator>, entity: impl Into<String>, payload: Value) -> Self {
        let entity = entity.into();
        Self {
            name: entity.clone(),
            entity,
            payload,
            keys: Vec::new(),
            mutator,
            apply: None,
            reconcile: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn affecting(mut self, key: CacheKey) -> Self {
        self.keys.push(key);
        self
    }

    /// Compute optimistic data from the current data of each key.
    pub fn with_apply<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.apply = Some(Arc::new(f));
        self
    }

    /// Merge a fixed JSON patch into the data of every affected key.
    pub fn with_patch(self, patch: Value) -> Self {
        self.with_apply(move |_, data| data.map(|data| merge_patch(data, &patch)))
    }

    pub fn with_reconcile<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheKey, Option<&Value>, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.reconcile = Some(Arc::new(f));
        self
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

#[async_trait]
impl MutationIntent for OptimisticMutation {
    fn name(&self) -> &str {
        &self.name
    }

    fn affected_keys(&self) -> Vec<CacheKey> {
        self.keys.clone()
    }

    fn apply(&self, key: &CacheKey, entry: &QueryEntry) -> Option<Value> {
        self.apply.as_ref().and_then(|f| f(key, entry.data.as_ref()))
    }

    async fn commit(&self) -> Result<Value, FetchError> {
        self.mutator.mutate(&self.entity, &self.payload).await
    }

    fn reconcile(&self, key: &CacheKey, entry: &QueryEntry, server_value: &Value) -> Option<Value> {
        self.reconcile
            .as_ref()
            .and_then(|f| f(key, entry.data.as_ref(), server_value))
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a field,
/// anything else replaces the target.
pub fn merge_patch(target: &Value, patch: &Value) -> Value {
    match (target, patch) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (field, change) in changes {
                if change.is_null() {
                    merged.remove(field);
                    continue;
                }
                let next = match merged.get(field) {
                    Some(existing) => merge_patch(existing, change),
                    None => merge_patch(&Value::Null, change),
                };
                merged.insert(field.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Object(_)) => merge_patch(&Value::Object(Default::default()), patch),
        (_, replacement) => replacement.clone(),
    }
}

/// Runs mutation intents against the store.
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    dispatcher: Arc<FetchDispatcher>,
    metrics: Arc<EngineMetrics>,
    locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    mutators: RwLock<HashMap<String, Arc<dyn QueryMutator>>>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, dispatcher: Arc<FetchDispatcher>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            locks: Mutex::new(HashMap::new()),
            mutators: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_mutator(&self, entity: impl Into<String>, mutator: Arc<dyn QueryMutator>) {
        self.mutators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.into(), mutator);
    }

    pub fn mutator_for(&self, entity: &str) -> Result<Arc<dyn QueryMutator>, FetchError> {
        self.mutators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
            .ok_or_else(|| FetchError::NoMutator {
                entity: entity.to_string(),
            })
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the per-key locks for `keys`, which must be sorted and unique.
    async fn acquire(&self, keys: &[CacheKey]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = Arc::clone(self.lock_table().entry(key.clone()).or_default());
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    fn release(&self, guards: Vec<OwnedMutexGuard<()>>) {
        drop(guards);
        self.lock_table().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Run an intent to completion, returning the server value or the
    /// commit error. Mutations are never retried.
    pub async fn run(&self, intent: &dyn MutationIntent) -> Result<Value, FetchError> {
        let (state_tx, _) = watch::channel(MutationState::Pending);
        self.execute(intent, &state_tx).await
    }

    /// Like [`run`](Self::run) but publishes every state transition.
    pub async fn execute(
        &self,
        intent: &dyn MutationIntent,
        state_tx: &watch::Sender<MutationState>,
    ) -> Result<Value, FetchError> {
        let mut keys = intent.affected_keys();
        keys.sort();
        keys.dedup();

        state_tx.send_replace(MutationState::Pending);
        let guards = self.acquire(&keys).await;

        // Snapshot and optimistic write happen under one store lock per key,
        // so no fetch result can land between them.
        let mut snapshots: Vec<(CacheKey, QueryEntry)> = Vec::with_capacity(keys.len());
        for key in &keys {
            let snapshot = self.store.update(key, |entry| {
                let snapshot = entry.clone();
                let changed = match intent.apply(key, entry) {
                    Some(data) => {
                        entry.detach_in_flight();
                        entry.data = Some(data);
                        true
                    }
                    None => false,
                };
                (snapshot, changed)
            });
            if let Some(snapshot) = snapshot {
                snapshots.push((key.clone(), snapshot));
            }
        }
        state_tx.send_replace(MutationState::Applied);

        state_tx.send_replace(MutationState::Committing);
        let result = intent.commit().await;

        match &result {
            Ok(server_value) => {
                for key in &keys {
                    self.store.update(key, |entry| match intent.reconcile(key, entry, server_value) {
                        Some(data) => {
                            entry.data = Some(data);
                            ((), true)
                        }
                        None => ((), false),
                    });
                }
                for key in &keys {
                    self.store.invalidate(key);
                }
                EngineMetrics::incr(&self.metrics.mutations_confirmed);
                tracing::debug!(mutation = intent.name(), keys = keys.len(), "Mutation confirmed");
                state_tx.send_replace(MutationState::Confirmed);
            }
            Err(error) => {
                for (key, snapshot) in snapshots {
                    let awaited = snapshot.in_flight_request_id;
                    self.store.put(&key, snapshot);
                    // The restored request may have settled, and been
                    // discarded, while the commit was outstanding.
                    if let Some(request_id) = awaited.filter(|id| !self.dispatcher.is_in_flight(*id)) {
                        tracing::debug!(key = %key, request_id = %request_id, "Restarting fetch lost during mutation");
                        drop(self.dispatcher.fetch(&key, FetchMode::Supersede));
                    }
                }
                EngineMetrics::incr(&self.metrics.mutations_rolled_back);
                tracing::warn!(
                    mutation = intent.name(),
                    keys = keys.len(),
                    error = %error,
                    "Mutation rolled back"
                );
                state_tx.send_replace(MutationState::RolledBack);
            }
        }

        self.release(guards);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::dispatch::FnFetcher;
    use pulse_core::{EngineConfig, KeyCodec, QueryStatus, RequestId};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Mutator whose answer is supplied by the test through a oneshot.
    struct Gate {
        answer: tokio::sync::Mutex<Option<oneshot::Receiver<Result<Value, FetchError>>>>,
    }

    impl Gate {
        fn new() -> (Arc<Self>, oneshot::Sender<Result<Value, FetchError>>) {
            let (tx, rx) = oneshot::channel();
            let gate = Arc::new(Self {
                answer: tokio::sync::Mutex::new(Some(rx)),
            });
            (gate, tx)
        }
    }

    #[async_trait]
    impl QueryMutator for Gate {
        async fn mutate(&self, _entity: &str, _payload: &Value) -> Result<Value, FetchError> {
            let rx = self.answer.lock().await.take();
            match rx {
                Some(rx) => rx.await.unwrap_or_else(|_| Err(FetchError::network("gate dropped"))),
                None => Err(FetchError::network("gate already used")),
            }
        }
    }

    fn store() -> Arc<CacheStore> {
        Arc::new(CacheStore::new(Arc::new(TokioClock::new())))
    }

    fn coordinator(store: &Arc<CacheStore>, metrics: Arc<EngineMetrics>) -> MutationCoordinator {
        let dispatcher = Arc::new(FetchDispatcher::new(
            Arc::clone(store),
            EngineConfig::default(),
            Arc::clone(&metrics),
        ));
        MutationCoordinator::new(Arc::clone(store), dispatcher, metrics)
    }

    fn queue_key() -> CacheKey {
        KeyCodec::encode_entity("queue_status").unwrap()
    }

    fn seed(store: &CacheStore, key: &CacheKey, data: Value) {
        let mut entry = QueryEntry::new(Duration::from_secs(2));
        entry.record_success(data, store.clock().now());
        store.put(key, entry);
    }

    #[test]
    fn test_merge_patch() {
        let base = json!({"paused": false, "depth": 4, "meta": {"a": 1, "b": 2}});
        let patched = merge_patch(&base, &json!({"paused": true, "meta": {"b": null, "c": 3}}));
        assert_eq!(patched, json!({"paused": true, "depth": 4, "meta": {"a": 1, "c": 3}}));
        assert_eq!(merge_patch(&json!([1, 2]), &json!("x")), json!("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_value_visible_then_rolled_back() {
        let store = store();
        let coordinator = Arc::new(coordinator(&store, Arc::new(EngineMetrics::new())));
        seed(&store, &queue_key(), json!({"paused": false, "depth": 9}));
        let before = store.get(&queue_key()).unwrap();

        let (gate, answer) = Gate::new();
        let intent = OptimisticMutation::new(gate, "queue_status", json!({"action": "pause"}))
            .affecting(queue_key())
            .with_patch(json!({"paused": true}));

        let (state_tx, mut state_rx) = watch::channel(MutationState::Pending);
        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.execute(&intent, &state_tx).await })
        };

        state_rx.wait_for(|s| *s == MutationState::Committing).await.unwrap();
        assert_eq!(
            store.get(&queue_key()).unwrap().data,
            Some(json!({"paused": true, "depth": 9}))
        );

        answer.send(Err(FetchError::conflict("queue changed"))).unwrap();
        let result = task.await.unwrap();

        assert_eq!(result, Err(FetchError::conflict("queue changed")));
        assert_eq!(store.get(&queue_key()).unwrap(), before);
        assert_eq!(*state_rx.borrow(), MutationState::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_keeps_error_and_restarts_lost_fetch() {
        let store = store();
        let coordinator = coordinator(&store, Arc::new(EngineMetrics::new()));
        coordinator
            .dispatcher
            .register_fallback(Arc::new(FnFetcher::new(|_entity: String, _params: Value| async {
                Ok::<_, FetchError>(json!({"paused": false, "depth": 2}))
            })));
        let key = queue_key();
        let mut entry = QueryEntry::new(Duration::from_secs(2));
        entry.record_success(json!({"paused": false}), store.clock().now());
        entry.record_failure(FetchError::server(503, "down"), 4, store.clock().now());
        // Request 11 settled while the commit was outstanding.
        entry.begin_fetch(RequestId::new(11));
        store.put(&key, entry.clone());

        let (gate, answer) = Gate::new();
        answer.send(Err(FetchError::server(500, "boom"))).unwrap();
        let intent = OptimisticMutation::new(gate, "queue_status", json!({}))
            .affecting(key.clone())
            .with_patch(json!({"paused": true}));

        assert!(coordinator.run(&intent).await.is_err());
        let restored = store.get(&key).unwrap();
        assert_eq!(restored.data, entry.data);
        assert_eq!(restored.error, entry.error);
        assert_eq!(restored.status, QueryStatus::Fetching);
        let restarted = restored.in_flight_request_id.unwrap();
        assert_ne!(restarted, RequestId::new(11));
        assert!(coordinator.dispatcher.is_in_flight(restarted));

        while coordinator.dispatcher.in_flight_count() > 0 {
            tokio::task::yield_now().await;
        }
        let settled = store.get(&key).unwrap();
        assert_eq!(settled.status, QueryStatus::Success);
        assert_eq!(settled.in_flight_request_id, None);
        assert_eq!(settled.data, Some(json!({"paused": false, "depth": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_reconciles_and_invalidates() {
        let store = store();
        let metrics = Arc::new(EngineMetrics::new());
        let coordinator = coordinator(&store, Arc::clone(&metrics));
        let queue = queue_key();
        let depth = KeyCodec::encode_entity("queue_depth_chart").unwrap();
        seed(&store, &queue, json!({"paused": false}));
        seed(&store, &depth, json!([1, 2, 3]));

        let (gate, answer) = Gate::new();
        answer.send(Ok(json!({"paused": true, "since": "now"}))).unwrap();
        let intent = OptimisticMutation::new(gate, "queue_status", json!({"action": "pause"}))
            .affecting(queue.clone())
            .affecting(depth.clone())
            .with_apply(|key, data| {
                (key.entity() == "queue_status")
                    .then(|| data.map(|d| merge_patch(d, &json!({"paused": true}))))
                    .flatten()
            })
            .with_reconcile(|key, _, server| (key.entity() == "queue_status").then(|| server.clone()));

        let result = coordinator.run(&intent).await;
        assert_eq!(result, Ok(json!({"paused": true, "since": "now"})));

        let queue_entry = store.get(&queue).unwrap();
        assert_eq!(queue_entry.data, Some(json!({"paused": true, "since": "now"})));
        assert!(queue_entry.invalidated);
        let depth_entry = store.get(&depth).unwrap();
        assert_eq!(depth_entry.data, Some(json!([1, 2, 3])));
        assert!(depth_entry.invalidated);
        assert_eq!(metrics.snapshot().mutations_confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_mutations_are_serialized() {
        let store = store();
        let coordinator = Arc::new(coordinator(&store, Arc::new(EngineMetrics::new())));
        seed(&store, &queue_key(), json!({"paused": false}));

        let (first_gate, first_answer) = Gate::new();
        let first = OptimisticMutation::new(first_gate, "queue_status", json!({"action": "pause"}))
            .affecting(queue_key())
            .with_patch(json!({"paused": true}));
        let (second_gate, second_answer) = Gate::new();
        let second = OptimisticMutation::new(second_gate, "queue_status", json!({"action": "drain"}))
            .affecting(queue_key())
            .with_patch(json!({"draining": true}));

        let (first_tx, mut first_rx) = watch::channel(MutationState::Pending);
        let (second_tx, mut second_rx) = watch::channel(MutationState::Pending);
        let first_task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.execute(&first, &first_tx).await })
        };
        first_rx.wait_for(|s| *s == MutationState::Committing).await.unwrap();

        let second_task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.execute(&second, &second_tx).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(*second_rx.borrow(), MutationState::Pending);
        assert_eq!(
            store.get(&queue_key()).unwrap().data,
            Some(json!({"paused": true}))
        );

        // The first rollback cannot clobber the second's optimistic write.
        first_answer.send(Err(FetchError::network("reset"))).unwrap();
        assert!(first_task.await.unwrap().is_err());

        second_rx.wait_for(|s| *s == MutationState::Committing).await.unwrap();
        assert_eq!(
            store.get(&queue_key()).unwrap().data,
            Some(json!({"paused": false, "draining": true}))
        );

        second_answer.send(Ok(json!({"ok": true}))).unwrap();
        assert!(second_task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_mutations_run_in_parallel() {
        let store = store();
        let coordinator = Arc::new(coordinator(&store, Arc::new(EngineMetrics::new())));
        let tasks = KeyCodec::encode_entity("task_list").unwrap();
        seed(&store, &queue_key(), json!({"paused": false}));
        seed(&store, &tasks, json!({"cancelled": []}));

        let (blocked_gate, _held) = Gate::new();
        let blocked = OptimisticMutation::new(blocked_gate, "queue_status", json!({}))
            .affecting(queue_key())
            .with_patch(json!({"paused": true}));
        let (free_gate, free_answer) = Gate::new();
        free_answer.send(Ok(json!({}))).unwrap();
        let free = OptimisticMutation::new(free_gate, "task_list", json!({"cancel": "t-1"}))
            .affecting(tasks.clone())
            .with_patch(json!({"cancelled": ["t-1"]}));

        let (blocked_tx, mut blocked_rx) = watch::channel(MutationState::Pending);
        let _blocked_task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.execute(&blocked, &blocked_tx).await })
        };
        blocked_rx.wait_for(|s| *s == MutationState::Committing).await.unwrap();

        assert!(coordinator.run(&free).await.is_ok());
        assert_eq!(store.get(&tasks).unwrap().data, Some(json!({"cancelled": ["t-1"]})));
    }

    #[tokio::test]
    async fn test_missing_mutator_is_reported() {
        let coordinator = coordinator(&store(), Arc::new(EngineMetrics::new()));
        assert!(matches!(
            coordinator.mutator_for("plugins"),
            Err(FetchError::NoMutator { .. })
        ));
    }
}
