//! Pulse Engine - Live Query Synchronization
//!
//! Keeps many independently polled views fresh without redundant network
//! traffic, applies user mutations optimistically, and suspends background
//! refresh while a user is inspecting a view.
//!
//! The cache store is the single mutable shared resource. The fetch
//! dispatcher and mutation coordinator are the only components that suspend,
//! and both write back through a re-read of the entry.

pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod metrics;
pub mod mutation;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod view;

pub use clock::{Clock, TokioClock};
pub use dispatch::{FetchDispatcher, FetchMode, FnFetcher, QueryFetcher, SharedFetch};
pub use engine::SyncEngine;
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use mutation::{
    merge_patch, MutationCoordinator, MutationIntent, MutationState, OptimisticMutation, QueryMutator,
};
pub use registry::{Subscription, SubscriptionId, SubscriptionRegistry};
pub use scheduler::Scheduler;
pub use store::{CacheStore, Listener};
pub use view::{MutationHandle, QueryHandle, QuerySnapshot, ViewState};

// Core types views and fetchers need alongside the engine.
pub use pulse_core::{
    CacheKey, EngineConfig, EntityPolicy, FetchError, KeyCodec, PulseError, PulseResult, QueryEntry,
    QueryOptions, QueryStatus,
};
