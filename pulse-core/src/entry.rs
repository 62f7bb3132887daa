//! Query entries and their state transitions.
//!
//! A `QueryEntry` is the store's record for one live cache key. The
//! transition helpers here are pure; the store and dispatcher decide when
//! to apply them.

use crate::error::{ErrorRecord, FetchError};
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Identifier of one logical fetch. Later requests get larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Lifecycle status of a query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Never fetched.
    Idle,
    /// A fetch is outstanding.
    Fetching,
    /// The most recent fetch succeeded.
    Success,
    /// The most recent fetch failed after retries.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Fetching => "fetching",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The cached state of one query.
///
/// `data` is never cleared by staleness. It is only replaced by a newer
/// successful fetch, an optimistic patch, or a rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    /// Last known-good payload (may be stale).
    pub data: Option<Value>,
    pub status: QueryStatus,
    /// When `data` was last written by a successful fetch.
    pub fetched_at: Option<Timestamp>,
    /// Data older than `fetched_at + stale_after` is eligible for refresh.
    pub stale_after: Duration,
    /// Set on the most recent failed fetch, cleared on the next success.
    pub error: Option<ErrorRecord>,
    /// Outstanding fetch for this key, used for dedup and discard.
    pub in_flight_request_id: Option<RequestId>,
    /// Explicitly invalidated; the effective `fetched_at` is the epoch.
    pub invalidated: bool,
}

impl QueryEntry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            fetched_at: None,
            stale_after,
            error: None,
            in_flight_request_id: None,
            invalidated: false,
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight_request_id.is_some()
    }

    /// `fetched_at` as seen by staleness checks: the epoch once invalidated.
    pub fn effective_fetched_at(&self) -> Option<Timestamp> {
        if self.invalidated {
            Some(Timestamp::UNIX_EPOCH)
        } else {
            self.fetched_at
        }
    }

    /// How old the data is at `now`, or `None` if never fetched.
    pub fn age(&self, now: Timestamp) -> Option<Duration> {
        self.effective_fetched_at().map(|fetched_at| {
            now.signed_duration_since(fetched_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the entry is eligible for a background refresh at `now`.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        match self.age(now) {
            Some(age) => self.invalidated || age >= self.stale_after,
            None => true,
        }
    }

    /// Mark a fetch as outstanding.
    pub fn begin_fetch(&mut self, request_id: RequestId) {
        self.in_flight_request_id = Some(request_id);
        self.status = QueryStatus::Fetching;
    }

    /// Record a successful fetch.
    pub fn record_success(&mut self, data: Value, now: Timestamp) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.fetched_at = Some(now);
        self.error = None;
        self.in_flight_request_id = None;
        self.invalidated = false;
    }

    /// Record a failed fetch. `data` is left untouched.
    pub fn record_failure(&mut self, error: FetchError, attempts: u32, now: Timestamp) {
        self.status = QueryStatus::Error;
        self.error = Some(ErrorRecord::new(error, attempts, now));
        self.in_flight_request_id = None;
    }

    /// Forget the outstanding fetch so its eventual result is discarded.
    ///
    /// Returns true if a request was detached.
    pub fn detach_in_flight(&mut self) -> bool {
        if self.in_flight_request_id.take().is_none() {
            return false;
        }
        if self.status == QueryStatus::Fetching {
            self.status = self.settled_status();
        }
        true
    }

    /// Status implied by the entry contents when no fetch is outstanding.
    fn settled_status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.fetched_at.is_some() || self.data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        }
    }
}
