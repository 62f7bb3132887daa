//! Pulse Core - Query Types
//!
//! Pure data structures for the Pulse sync engine: canonical cache keys,
//! query entries, the error taxonomy and configuration. No async runtime.

use chrono::{DateTime, Utc};

pub mod config;
pub mod entry;
pub mod error;
pub mod key;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier for subscriptions and mutations, UUIDv7 so ids sort by creation.
pub type EntityId = uuid::Uuid;

/// Generate a new UUIDv7 identifier.
pub fn new_entity_id() -> EntityId {
    uuid::Uuid::now_v7()
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{entities, EngineConfig, EntityPolicy, QueryOptions, RetryPolicy, MAX_INTERVAL_MS};
pub use entry::{QueryEntry, QueryStatus, RequestId};
pub use error::{
    ConfigError, EngineError, ErrorRecord, FetchError, KeyError, PulseError, PulseResult,
};
pub use key::{CacheKey, KeyCodec};
