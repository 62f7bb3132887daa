//! Poll scheduler.
//!
//! Each subscription with an interval gets its own tick task. Tick `n` is
//! due at `start + n * interval + jitter_n`, where `jitter_n` is drawn fresh
//! for every tick from `[0, jitter_ratio * interval]`. Jitter never carries
//! over to the next tick, so the long-run cadence is exactly the interval.
//!
//! On each tick the task checks the registry:
//!
//! - subscription gone: the task exits
//! - paused: the tick is skipped and the task stays armed
//! - otherwise: a deduplicated refresh is requested and not awaited

use crate::dispatch::{FetchDispatcher, FetchMode};
use crate::metrics::EngineMetrics;
use crate::registry::{SubscriptionId, SubscriptionRegistry};
use pulse_core::CacheKey;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Draw the jitter for one tick.
pub fn jitter_for<R: Rng>(rng: &mut R, interval: Duration, ratio: f64) -> Duration {
    let max_ms = (interval.as_millis() as f64 * ratio.max(0.0)) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=max_ms))
}

/// Due time of tick `n` before jitter, or `None` past the clock's range.
fn tick_due(start: Instant, interval: Duration, tick: u32) -> Option<Instant> {
    interval.checked_mul(tick).and_then(|offset| start.checked_add(offset))
}

/// Drives background refreshes for subscriptions.
pub struct Scheduler {
    dispatcher: Arc<FetchDispatcher>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<EngineMetrics>,
    jitter_ratio: f64,
    tasks: Mutex<HashMap<SubscriptionId, AbortHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        dispatcher: Arc<FetchDispatcher>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<EngineMetrics>,
        jitter_ratio: f64,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dispatcher,
            registry,
            metrics,
            jitter_ratio,
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<SubscriptionId, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start ticking for a subscription. Must be called within a tokio runtime.
    ///
    /// The first tick is one interval (plus jitter) from now.
    pub fn start(&self, id: SubscriptionId, key: CacheKey, interval: Duration) {
        if *self.shutdown_tx.borrow() || interval.is_zero() {
            return;
        }

        let ticker = Ticker {
            id,
            key,
            interval,
            jitter_ratio: self.jitter_ratio,
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(ticker.run(shutdown_rx));

        if let Some(previous) = self.tasks().insert(id, handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Stop ticking for a subscription. In-flight fetches are left alone.
    pub fn stop(&self, id: SubscriptionId) -> bool {
        match self.tasks().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of subscriptions with a live tick task.
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }

    /// Stop every tick task and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for (_, handle) in self.tasks().drain() {
            handle.abort();
        }
    }
}

struct Ticker {
    id: SubscriptionId,
    key: CacheKey,
    interval: Duration,
    jitter_ratio: f64,
    dispatcher: Arc<FetchDispatcher>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl Ticker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let start = Instant::now();
        let mut tick: u32 = 0;

        tracing::debug!(
            subscription = %self.id,
            key = %self.key,
            interval_ms = self.interval.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            tick = tick.saturating_add(1);
            let jitter = jitter_for(&mut rand::rng(), self.interval, self.jitter_ratio);
            let Some(deadline) = tick_due(start, self.interval, tick).and_then(|due| due.checked_add(jitter)) else {
                tracing::warn!(
                    subscription = %self.id,
                    key = %self.key,
                    interval_ms = self.interval.as_millis() as u64,
                    "Poll interval out of range, scheduler stopping"
                );
                break;
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    match self.registry.is_paused(self.id) {
                        None => break,
                        Some(true) => {
                            EngineMetrics::incr(&self.metrics.ticks_skipped_paused);
                            tracing::trace!(subscription = %self.id, tick, "Tick skipped while paused");
                        }
                        Some(false) => {
                            EngineMetrics::incr(&self.metrics.ticks_fired);
                            // Result lands in the store; nobody waits on it here.
                            drop(self.dispatcher.fetch(&self.key, FetchMode::Deduplicate));
                        }
                    }

                    // Skip deadlines that passed while this task was starved.
                    let now = Instant::now();
                    while tick_due(start, self.interval, tick.saturating_add(1)).is_some_and(|due| due <= now) {
                        tick = tick.saturating_add(1);
                    }
                }
            }
        }

        tracing::debug!(subscription = %self.id, key = %self.key, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::dispatch::FnFetcher;
    use crate::store::CacheStore;
    use proptest::prelude::*;
    use pulse_core::{EngineConfig, FetchError, KeyCodec};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        scheduler: Scheduler,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<EngineMetrics>,
        calls: Arc<AtomicU32>,
    }

    fn fixture(jitter_ratio: f64) -> Fixture {
        let store = Arc::new(CacheStore::new(Arc::new(TokioClock::new())));
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(FetchDispatcher::new(
            store,
            EngineConfig::default(),
            Arc::clone(&metrics),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        dispatcher.register_fallback(Arc::new(FnFetcher::new(move |_entity: String, _params: Value| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, FetchError>(json!({"tick": n})) }
        })));

        let registry = Arc::new(SubscriptionRegistry::new());
        let scheduler = Scheduler::new(
            dispatcher,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            jitter_ratio,
        );
        Fixture {
            scheduler,
            registry,
            metrics,
            calls,
        }
    }

    fn key() -> CacheKey {
        KeyCodec::encode_entity("queue_status").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_interval() {
        let f = fixture(0.10);
        let interval = Duration::from_millis(3_000);
        let id = f.registry.subscribe("queue", key(), Some(interval));
        f.scheduler.start(id, key(), interval);

        // Ten intervals plus the largest possible jitter.
        tokio::time::sleep(Duration::from_millis(30_301)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 10);
        assert_eq!(f.metrics.snapshot().ticks_fired, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_subscription_skips_ticks() {
        let f = fixture(0.0);
        let interval = Duration::from_millis(1_000);
        let id = f.registry.subscribe("errors", key(), Some(interval));
        f.scheduler.start(id, key(), interval);
        f.registry.set_paused(id, true);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.metrics.snapshot().ticks_skipped_paused, 5);

        // No catch-up tick when resuming.
        f.registry.set_paused(id, false);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_when_subscription_is_destroyed() {
        let f = fixture(0.0);
        let interval = Duration::from_millis(1_000);
        let id = f.registry.subscribe("logs", key(), Some(interval));
        f.scheduler.start(id, key(), interval);
        assert_eq!(f.scheduler.active(), 1);

        f.registry.unsubscribe(id);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_shutdown() {
        let f = fixture(0.0);
        let interval = Duration::from_millis(1_000);
        let a = f.registry.subscribe("a", key(), Some(interval));
        let b = f.registry.subscribe("b", key(), Some(interval));
        f.scheduler.start(a, key(), interval);
        f.scheduler.start(b, key(), interval);

        assert!(f.scheduler.stop(a));
        assert!(!f.scheduler.stop(a));

        f.scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        f.scheduler.start(a, key(), interval);
        assert_eq!(f.scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_interval_stops_ticker() {
        let f = fixture(0.10);
        let interval = Duration::MAX;
        let id = f.registry.subscribe("archive", key(), Some(interval));
        f.scheduler.start(id, key(), interval);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.scheduler.active(), 0);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.metrics.snapshot().ticks_fired, 0);
    }

    #[test]
    fn test_tick_due_reports_overflow() {
        let start = Instant::now();
        let interval = Duration::from_millis(3_000);
        assert_eq!(tick_due(start, interval, 2), Some(start + Duration::from_millis(6_000)));
        assert_eq!(tick_due(start, Duration::MAX, 2), None);
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_within_ratio(
            seed in any::<u64>(),
            interval_ms in 1u64..200_000,
            ratio in 0.0f64..1.0,
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let interval = Duration::from_millis(interval_ms);
            let jitter = jitter_for(&mut rng, interval, ratio);
            let max = Duration::from_millis((interval_ms as f64 * ratio) as u64);
            prop_assert!(jitter <= max);
        }
    }
}
