//! Deduplicating fetch dispatcher.
//!
//! A logical fetch runs on its own tokio task behind a `Shared` future, so
//! every caller that joins it observes the same result and dropping a caller
//! never cancels the network request. Results are written back through a
//! re-read of the entry: only the request the entry still points at may
//! write, anything else is discarded.

use crate::metrics::EngineMetrics;
use crate::store::CacheStore;
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use pulse_core::{CacheKey, EngineConfig, FetchError, QueryOptions, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Fetcher trait for loading one entity's payload from the backend.
///
/// Implementations wrap transport status codes into [`FetchError`]; the
/// engine never inspects the transport itself.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    /// Fetch the current value for `entity` with the given params object.
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, FetchError>;
}

/// Adapter turning an async closure into a [`QueryFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> QueryFetcher for FnFetcher<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send,
{
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, FetchError> {
        (self.f)(entity.to_string(), params.clone()).await
    }
}

/// How a fetch request treats an already outstanding request for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Join the outstanding request if there is one.
    #[default]
    Deduplicate,
    /// Start a new request that replaces the outstanding one.
    Supersede,
}

/// The future every waiter on one logical fetch polls.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

enum Claim {
    Started,
    Joined(RequestId),
}

/// Issues fetches, collapses duplicates and writes results to the store.
pub struct FetchDispatcher {
    store: Arc<CacheStore>,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    fetchers: RwLock<HashMap<String, Arc<dyn QueryFetcher>>>,
    fallback: RwLock<Option<Arc<dyn QueryFetcher>>>,
    in_flight: Mutex<HashMap<RequestId, SharedFetch>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
}

impl FetchDispatcher {
    pub fn new(store: Arc<CacheStore>, config: EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
            fetchers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register the fetcher for one entity, replacing any previous one.
    pub fn register(&self, entity: impl Into<String>, fetcher: Arc<dyn QueryFetcher>) {
        self.fetchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.into(), fetcher);
    }

    /// Register the fetcher used for entities without their own.
    pub fn register_fallback(&self, fetcher: Arc<dyn QueryFetcher>) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(fetcher);
    }

    fn fetcher_for(&self, entity: &str) -> Option<Arc<dyn QueryFetcher>> {
        let own = self
            .fetchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned();
        own.or_else(|| {
            self.fallback
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Number of logical fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The running fetch for `request_id`, if it has not finished yet.
    pub fn running(&self, request_id: RequestId) -> Option<SharedFetch> {
        self.in_flight_map().get(&request_id).cloned()
    }

    pub fn is_in_flight(&self, request_id: RequestId) -> bool {
        self.in_flight_map().contains_key(&request_id)
    }

    /// Refuse new fetches. Running ones finish and write their results.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Request a refresh of `key`.
    ///
    /// Must be called from within a tokio runtime. The returned future
    /// resolves once the logical fetch (including retries) settles; it does
    /// not need to be polled for the fetch to make progress.
    pub fn fetch(self: &Arc<Self>, key: &CacheKey, mode: FetchMode) -> SharedFetch {
        if self.closed.load(Ordering::SeqCst) {
            return ready(Err(FetchError::Aborted {
                reason: "engine shut down".to_string(),
            }));
        }

        let (_, stale_after) = self.config.resolve(key.entity(), &QueryOptions::default());

        let Some(fetcher) = self.fetcher_for(key.entity()) else {
            let error = FetchError::NoFetcher {
                entity: key.entity().to_string(),
            };
            let now = self.store.clock().now();
            self.store.upsert(key, stale_after, |entry| {
                entry.record_failure(error.clone(), 0, now);
                ((), true)
            });
            tracing::warn!(key = %key, "No fetcher registered");
            return ready(Err(error));
        };

        let request_id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1);
        let timeout = self.config.timeout_for(key.entity());
        let shared = {
            let this = Arc::clone(self);
            let key = key.clone();
            async move { this.run(key, request_id, fetcher, timeout).await }
                .boxed()
                .shared()
        };

        // Published before the entry points at it so a concurrent joiner
        // always finds the future.
        self.in_flight_map().insert(request_id, shared.clone());

        let claim = self.store.upsert(key, stale_after, |entry| {
            match (mode, entry.in_flight_request_id) {
                (FetchMode::Deduplicate, Some(existing)) => (Claim::Joined(existing), false),
                _ => {
                    entry.begin_fetch(request_id);
                    (Claim::Started, true)
                }
            }
        });

        match claim {
            Claim::Started => {
                tracing::debug!(key = %key, request_id = %request_id, ?mode, "Fetch started");
                tokio::spawn(shared.clone());
                shared
            }
            Claim::Joined(existing) => {
                let joined = {
                    let mut in_flight = self.in_flight_map();
                    in_flight.remove(&request_id);
                    in_flight.get(&existing).cloned()
                };
                match joined {
                    Some(joined) => {
                        EngineMetrics::incr(&self.metrics.deduplicated);
                        tracing::trace!(key = %key, request_id = %existing, "Joined in-flight fetch");
                        joined
                    }
                    // The outstanding request finished between the two reads.
                    None => self.fetch(key, FetchMode::Supersede),
                }
            }
        }
    }

    fn in_flight_map(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, SharedFetch>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        self: Arc<Self>,
        key: CacheKey,
        request_id: RequestId,
        fetcher: Arc<dyn QueryFetcher>,
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        let params = key.params_json();
        let retry = &self.config.retry;
        let mut attempts: u32 = 0;

        let result = loop {
            attempts += 1;
            EngineMetrics::incr(&self.metrics.network_calls);

            let outcome = match tokio::time::timeout(timeout, fetcher.fetch(key.entity(), &params)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout { after: timeout }),
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(error) if retry.should_retry(&error, attempts) => {
                    let delay = retry.delay_for_retry(attempts);
                    EngineMetrics::incr(&self.metrics.retries);
                    tracing::debug!(
                        key = %key,
                        request_id = %request_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Fetch attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    EngineMetrics::incr(&self.metrics.fetch_failures);
                    if error.is_retryable() {
                        tracing::warn!(
                            key = %key,
                            request_id = %request_id,
                            attempts = attempts,
                            error = %error,
                            "Fetch retries exhausted"
                        );
                    } else {
                        tracing::debug!(key = %key, request_id = %request_id, error = %error, "Fetch failed");
                    }
                    break Err(error);
                }
            }
        };

        // Unpublish before settling so a rolled-back entry can tell a
        // finished request from a running one.
        self.in_flight_map().remove(&request_id);
        self.settle(&key, request_id, &result, attempts);
        result
    }

    /// Write a finished fetch to its entry if the entry still awaits it.
    fn settle(&self, key: &CacheKey, request_id: RequestId, result: &Result<Value, FetchError>, attempts: u32) {
        let now = self.store.clock().now();
        let written = self
            .store
            .update(key, |entry| {
                if entry.in_flight_request_id != Some(request_id) {
                    return (false, false);
                }
                match result {
                    Ok(value) => entry.record_success(value.clone(), now),
                    Err(error) => entry.record_failure(error.clone(), attempts, now),
                }
                (true, true)
            })
            .unwrap_or(false);

        if !written {
            EngineMetrics::incr(&self.metrics.stale_responses_discarded);
            tracing::debug!(key = %key, request_id = %request_id, "Discarding superseded fetch response");
        }
    }
}

fn ready(result: Result<Value, FetchError>) -> SharedFetch {
    future::ready(result).boxed().shared()
}
