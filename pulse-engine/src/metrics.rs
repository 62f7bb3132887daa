//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected over the engine's lifetime.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Fetcher invocations, counting every retry attempt
    pub network_calls: AtomicU64,

    /// Fetch requests that joined an in-flight request instead of calling out
    pub deduplicated: AtomicU64,

    /// Retry attempts scheduled after a retryable failure
    pub retries: AtomicU64,

    /// Fetch results dropped because a newer request superseded them
    pub stale_responses_discarded: AtomicU64,

    /// Logical fetches that ended in failure after retries
    pub fetch_failures: AtomicU64,

    pub mutations_confirmed: AtomicU64,
    pub mutations_rolled_back: AtomicU64,

    /// Entries removed after their grace period
    pub evictions: AtomicU64,

    pub ticks_fired: AtomicU64,
    pub ticks_skipped_paused: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            network_calls: self.network_calls.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stale_responses_discarded: self.stale_responses_discarded.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            mutations_confirmed: self.mutations_confirmed.load(Ordering::Relaxed),
            mutations_rolled_back: self.mutations_rolled_back.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ticks_fired: self.ticks_fired.load(Ordering::Relaxed),
            ticks_skipped_paused: self.ticks_skipped_paused.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub network_calls: u64,
    pub deduplicated: u64,
    pub retries: u64,
    pub stale_responses_discarded: u64,
    pub fetch_failures: u64,
    pub mutations_confirmed: u64,
    pub mutations_rolled_back: u64,
    pub evictions: u64,
    pub ticks_fired: u64,
    pub ticks_skipped_paused: u64,
}
