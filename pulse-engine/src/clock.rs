//! Time source for the engine.
//!
//! Timestamps are derived from the tokio clock so that paused test time
//! (`#[tokio::test(start_paused = true)]`) drives entry timestamps, poll
//! timers and retry backoff together.

use chrono::Utc;
use pulse_core::Timestamp;
use tokio::time::Instant;

/// Source of "now" for entry timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Current monotonic instant on the timer clock.
    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Wall clock anchored to the tokio timer clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: Timestamp,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor the clock so that the current instant maps to `wall`.
    pub fn anchored_at(wall: Timestamp) -> Self {
        Self {
            origin_wall: wall,
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        match chrono::Duration::from_std(elapsed) {
            Ok(delta) => self.origin_wall + delta,
            Err(_) => self.origin_wall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(30)).await;

        let elapsed = clock.now().signed_duration_since(start);
        assert_eq!(elapsed.num_seconds(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchor_sets_wall_origin() {
        let clock = TokioClock::anchored_at(Timestamp::UNIX_EPOCH);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now().timestamp_millis(), 1_500);
    }
}
