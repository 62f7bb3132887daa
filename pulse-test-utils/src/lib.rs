//! Pulse Test Utilities
//!
//! Shared test infrastructure for the Pulse workspace:
//! - Scripted fetchers and mutators with call recording
//! - Proptest generators for keys, params and configuration
//! - Fixtures for the dashboard entities
//! - Assertions for Pulse results

pub use pulse_core::{
    entities, CacheKey, EngineConfig, EntityPolicy, FetchError, KeyCodec, KeyError, PulseError,
    PulseResult, QueryEntry, QueryOptions, QueryStatus, RetryPolicy,
};
pub use pulse_engine::{QueryFetcher, QueryMutator, SyncEngine};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

// ============================================================================
// SCRIPTED PROVIDERS
// ============================================================================

type Reply = Result<Value, FetchError>;

enum Step {
    After(Duration, Reply),
    Gated(oneshot::Receiver<Reply>),
}

impl Step {
    async fn resolve(self) -> Reply {
        match self {
            Step::After(delay, reply) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                reply
            }
            Step::Gated(rx) => rx
                .await
                .unwrap_or_else(|_| Err(FetchError::network("gate dropped"))),
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub entity: String,
    pub params: Value,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
}

impl Script {
    fn push(&self, step: Step) {
        self.lock_steps().push_back(step);
    }

    fn lock_steps(&self) -> std::sync::MutexGuard<'_, VecDeque<Step>> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, entity: &str, params: &Value) -> Option<Step> {
        self.lock_calls().push(Call {
            entity: entity.to_string(),
            params: params.clone(),
            at: Instant::now(),
        });
        self.lock_steps().pop_front()
    }
}

/// Fetcher that replays queued replies, then falls back to a counting payload.
///
/// The fallback payload is `{"entity": .., "params": .., "seq": n}` where `n`
/// counts calls, so every successful fetch yields distinct data.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Script,
    latency: Duration,
    seq: AtomicU64,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to fallback replies.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_ok(&self, value: Value) {
        self.script.push(Step::After(Duration::ZERO, Ok(value)));
    }

    pub fn push_err(&self, error: FetchError) {
        self.script.push(Step::After(Duration::ZERO, Err(error)));
    }

    /// Queue a reply delivered after `delay`.
    pub fn push_after(&self, delay: Duration, reply: Result<Value, FetchError>) {
        self.script.push(Step::After(delay, reply));
    }

    /// Queue a reply the test releases by sending on the returned channel.
    pub fn push_gated(&self) -> oneshot::Sender<Result<Value, FetchError>> {
        let (tx, rx) = oneshot::channel();
        self.script.push(Step::Gated(rx));
        tx
    }

    pub fn call_count(&self) -> usize {
        self.script.lock_calls().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock_calls().clone()
    }

    pub fn calls_for(&self, entity: &str) -> usize {
        self.script
            .lock_calls()
            .iter()
            .filter(|c| c.entity == entity)
            .count()
    }

    /// Gaps between consecutive calls.
    pub fn call_gaps(&self) -> Vec<Duration> {
        self.script
            .lock_calls()
            .windows(2)
            .map(|w| w[1].at.saturating_duration_since(w[0].at))
            .collect()
    }
}

#[async_trait]
impl QueryFetcher for ScriptedFetcher {
    async fn fetch(&self, entity: &str, params: &Value) -> Result<Value, FetchError> {
        let step = self.script.record(entity, params);
        match step {
            Some(step) => step.resolve().await,
            None => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                Step::After(self.latency, Ok(json!({"entity": entity, "params": params, "seq": seq})))
                    .resolve()
                    .await
            }
        }
    }
}

/// Mutator that replays queued replies, then acknowledges with the payload.
#[derive(Default)]
pub struct ScriptedMutator {
    script: Script,
}

impl ScriptedMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, value: Value) {
        self.script.push(Step::After(Duration::ZERO, Ok(value)));
    }

    pub fn push_err(&self, error: FetchError) {
        self.script.push(Step::After(Duration::ZERO, Err(error)));
    }

    pub fn push_gated(&self) -> oneshot::Sender<Result<Value, FetchError>> {
        let (tx, rx) = oneshot::channel();
        self.script.push(Step::Gated(rx));
        tx
    }

    pub fn call_count(&self) -> usize {
        self.script.lock_calls().len()
    }

    /// Payloads sent so far, in order.
    pub fn payloads(&self) -> Vec<Value> {
        self.script.lock_calls().iter().map(|c| c.params.clone()).collect()
    }
}

#[async_trait]
impl QueryMutator for ScriptedMutator {
    async fn mutate(&self, entity: &str, payload: &Value) -> Result<Value, FetchError> {
        match self.script.record(entity, payload) {
            Some(step) => step.resolve().await,
            None => Ok(json!({"entity": entity, "accepted": payload})),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Pulse types.

    use super::*;
    use proptest::prelude::*;

    /// Entity names as the dashboard spells them.
    pub fn arb_entity() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,23}"
    }

    /// A JSON scalar allowed as a key param.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1.0e9f64..1.0e9).prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::String),
        ]
    }

    /// A params object of scalars.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z_]{1,10}", arb_scalar(), 0..6)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    /// A params object with at least one nested array or object.
    pub fn arb_nested_params() -> impl Strategy<Value = Value> {
        (arb_params(), "[a-z_]{1,10}", prop::collection::vec(arb_scalar(), 0..3), any::<bool>())
            .prop_map(|(params, field, items, as_object)| {
                let mut map = match params {
                    Value::Object(map) => map,
                    _ => Default::default(),
                };
                let nested = if as_object {
                    json!({"inner": items})
                } else {
                    Value::Array(items)
                };
                map.insert(field, nested);
                Value::Object(map)
            })
    }

    pub fn arb_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (0u32..6, 1u64..2_000, 1.0f64..4.0, 0u64..10_000).prop_map(
            |(max_retries, base_delay_ms, factor, extra)| RetryPolicy {
                max_retries,
                base_delay_ms,
                factor,
                max_delay_ms: base_delay_ms + extra,
            },
        )
    }

    pub fn arb_entity_policy() -> impl Strategy<Value = EntityPolicy> {
        (
            prop::option::of(1u64..120_000),
            0u64..120_000,
            prop::option::of(1u64..30_000),
        )
            .prop_map(|(interval_ms, stale_after_ms, timeout_ms)| EntityPolicy {
                interval_ms,
                stale_after_ms,
                timeout_ms,
            })
    }

    /// A configuration that passes validation.
    pub fn arb_valid_engine_config() -> impl Strategy<Value = EngineConfig> {
        (
            0u64..300_000,
            0.0f64..0.5,
            1u64..30_000,
            arb_retry_policy(),
            prop::collection::btree_map(arb_entity(), arb_entity_policy(), 0..5),
        )
            .prop_map(
                |(gc_grace_ms, jitter_ratio, default_timeout_ms, retry, entities)| EngineConfig {
                    gc_grace_ms,
                    jitter_ratio,
                    default_timeout_ms,
                    default_stale_after_ms: 0,
                    retry,
                    entities,
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Payloads and configuration for the dashboard entities.

    use super::*;

    /// Queue status payload.
    pub fn queue_status(paused: bool, depth: u64) -> Value {
        json!({
            "queue": "default",
            "paused": paused,
            "depth": depth,
            "workers": 4,
        })
    }

    /// Task list payload with the given ids, all running.
    pub fn task_list(ids: &[&str]) -> Value {
        let tasks: Vec<Value> = ids
            .iter()
            .map(|id| json!({"id": id, "state": "running"}))
            .collect();
        json!({"tasks": tasks, "total": ids.len()})
    }

    /// Failed executions for the agent error view.
    pub fn failed_executions(count: usize) -> Value {
        let rows: Vec<Value> = (0..count)
            .map(|i| json!({"id": format!("exec-{}", i), "status": "failed", "duration_ms": 1_200 + i * 10}))
            .collect();
        json!({"rows": rows})
    }

    pub fn queue_key() -> CacheKey {
        key(entities::QUEUE_STATUS, Value::Null)
    }

    pub fn failed_executions_key() -> CacheKey {
        key("executions", json!({"status": "failed"}))
    }

    /// Encode a key, panicking on invalid params.
    pub fn key(entity: &str, params: Value) -> CacheKey {
        match KeyCodec::encode(entity, &params) {
            Ok(key) => key,
            Err(e) => panic!("fixture key {} is invalid: {}", entity, e),
        }
    }

    /// The dashboard table with no jitter, so tick times are exact.
    pub fn deterministic_config() -> EngineConfig {
        EngineConfig::dashboard_defaults().with_jitter_ratio(0.0)
    }

    /// A successful entry holding `data` that was never fetched over the network.
    pub fn entry_with(data: Value, stale_after: Duration) -> QueryEntry {
        let mut entry = QueryEntry::new(stale_after);
        entry.data = Some(data);
        entry.status = QueryStatus::Success;
        entry
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Pulse results.

    use super::*;

    /// Assert that a PulseResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &PulseResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a PulseResult is an InvalidKeyShape error.
    #[track_caller]
    pub fn assert_invalid_key_shape<T: std::fmt::Debug>(result: &PulseResult<T>) {
        match result {
            Err(PulseError::Key(KeyError::InvalidKeyShape { .. })) => {}
            other => panic!("Expected InvalidKeyShape, got: {:?}", other),
        }
    }

    /// Assert that a PulseResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &PulseResult<T>) {
        match result {
            Err(PulseError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that an entry ended in success with no error recorded.
    #[track_caller]
    pub fn assert_settled_ok(entry: &QueryEntry) {
        assert_eq!(entry.status, QueryStatus::Success, "entry: {:?}", entry);
        assert!(entry.error.is_none(), "unexpected error: {:?}", entry.error);
        assert!(entry.in_flight_request_id.is_none(), "fetch still outstanding");
    }
}
