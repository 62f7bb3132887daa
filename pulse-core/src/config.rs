//! Configuration types

use crate::error::{ConfigError, FetchError, PulseError, PulseResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Longest accepted poll interval: one week.
pub const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Well-known entity names for the dashboard views.
pub mod entities {
    pub const QUEUE_STATUS: &str = "queue_status";
    pub const QUEUE_DEPTH_CHART: &str = "queue_depth_chart";
    pub const TASK_LIST: &str = "task_list";
    pub const PLUGIN_SYNC_LOGS: &str = "plugin_sync_logs";
    pub const AGENT_TREND: &str = "agent_trend";
    pub const AGENT_ERRORS: &str = "agent_errors";
    pub const AGENT_SLOWEST: &str = "agent_slowest";
}

/// Retry and backoff policy for fetches.
///
/// One initial attempt is followed by up to `max_retries` retries. The delay
/// before retry `n` (1-based) is `base_delay_ms * factor^(n-1)`, capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            factor: 2.0,
            max_delay_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts allowed for one logical fetch.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether a failed attempt should be retried.
    ///
    /// `attempts_made` counts the attempt that just failed.
    pub fn should_retry(&self, error: &FetchError, attempts_made: u32) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts()
    }
}

/// Refresh policy for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityPolicy {
    /// Background refresh cadence; `None` means fetch once.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    pub stale_after_ms: u64,
    /// Per-attempt fetch timeout; falls back to the engine default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EntityPolicy {
    pub fn new(interval_ms: Option<u64>, stale_after_ms: u64) -> Self {
        Self {
            interval_ms,
            stale_after_ms,
            timeout_ms: None,
        }
    }

    /// Poll every `interval_ms`, stale after `stale_after_ms`.
    pub fn polled(interval_ms: u64, stale_after_ms: u64) -> Self {
        Self::new(Some(interval_ms), stale_after_ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Per-subscription options supplied by a view when it mounts a query.
///
/// Unset fields fall back to the entity policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Name of the mounting view, for logs. Defaults to the entity name.
    pub view: Option<String>,
    pub interval: Option<Duration>,
    pub stale_after: Option<Duration>,
    /// Disable background polling even if the entity policy has an interval.
    pub fetch_once: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self.fetch_once = false;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn fetch_once(mut self) -> Self {
        self.interval = None;
        self.fetch_once = true;
        self
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How long an unsubscribed entry survives before eviction.
    pub gc_grace_ms: u64,
    /// Maximum scheduler jitter as a fraction of the interval.
    pub jitter_ratio: f64,
    pub default_timeout_ms: u64,
    pub default_stale_after_ms: u64,
    pub retry: RetryPolicy,
    pub entities: BTreeMap<String, EntityPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_grace_ms: 60_000,
            jitter_ratio: 0.10,
            default_timeout_ms: 5_000,
            default_stale_after_ms: 0,
            retry: RetryPolicy::default(),
            entities: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine defaults plus the refresh table used by the operator dashboard.
    pub fn dashboard_defaults() -> Self {
        Self::default()
            .with_entity(entities::QUEUE_STATUS, EntityPolicy::polled(3_000, 2_000))
            .with_entity(entities::QUEUE_DEPTH_CHART, EntityPolicy::polled(10_000, 8_000))
            .with_entity(entities::TASK_LIST, EntityPolicy::polled(5_000, 4_000))
            .with_entity(entities::PLUGIN_SYNC_LOGS, EntityPolicy::polled(30_000, 25_000))
            .with_entity(entities::AGENT_TREND, EntityPolicy::polled(60_000, 60_000))
            .with_entity(entities::AGENT_ERRORS, EntityPolicy::polled(60_000, 60_000))
            .with_entity(entities::AGENT_SLOWEST, EntityPolicy::polled(90_000, 90_000))
    }

    pub fn with_entity(mut self, entity: impl Into<String>, policy: EntityPolicy) -> Self {
        self.entities.insert(entity.into(), policy);
        self
    }

    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_millis(self.gc_grace_ms)
    }

    /// The policy for an entity, or a fetch-once default.
    pub fn policy_for(&self, entity: &str) -> EntityPolicy {
        self.entities
            .get(entity)
            .cloned()
            .unwrap_or_else(|| EntityPolicy::new(None, self.default_stale_after_ms))
    }

    /// Per-attempt timeout for an entity.
    pub fn timeout_for(&self, entity: &str) -> Duration {
        let ms = self
            .entities
            .get(entity)
            .and_then(|p| p.timeout_ms)
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Resolve a view's options against the entity policy.
    ///
    /// Returns `(interval, stale_after)`.
    pub fn resolve(&self, entity: &str, options: &QueryOptions) -> (Option<Duration>, Duration) {
        let policy = self.policy_for(entity);
        let interval = if options.fetch_once {
            None
        } else {
            options.interval.or_else(|| policy.interval())
        };
        let stale_after = options.stale_after.unwrap_or_else(|| policy.stale_after());
        (interval, stale_after)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - default_timeout_ms > 0
    /// - jitter_ratio in [0.0, 1.0)
    /// - retry.factor >= 1.0 and retry.max_delay_ms >= retry.base_delay_ms
    /// - every entity interval and timeout is positive
    /// - no entity interval exceeds [`MAX_INTERVAL_MS`]
    pub fn validate(&self) -> PulseResult<()> {
        if self.default_timeout_ms == 0 {
            return Err(invalid(
                "default_timeout_ms",
                self.default_timeout_ms.to_string(),
                "default_timeout_ms must be greater than 0",
            ));
        }

        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(invalid(
                "jitter_ratio",
                self.jitter_ratio.to_string(),
                "jitter_ratio must be in [0.0, 1.0)",
            ));
        }

        if self.retry.factor.is_nan() || self.retry.factor < 1.0 {
            return Err(invalid(
                "retry.factor",
                self.retry.factor.to_string(),
                "factor must be >= 1.0",
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms",
                self.retry.max_delay_ms.to_string(),
                "max_delay_ms must be >= base_delay_ms",
            ));
        }

        for (entity, policy) in &self.entities {
            if entity.trim().is_empty() {
                return Err(PulseError::Config(ConfigError::MissingRequired {
                    field: "entities.<name>".to_string(),
                }));
            }
            if policy.interval_ms == Some(0) {
                return Err(invalid(
                    &format!("entities.{}.interval_ms", entity),
                    "0".to_string(),
                    "interval_ms must be greater than 0",
                ));
            }
            if let Some(ms) = policy.interval_ms.filter(|ms| *ms > MAX_INTERVAL_MS) {
                return Err(invalid(
                    &format!("entities.{}.interval_ms", entity),
                    ms.to_string(),
                    "interval_ms must be at most one week",
                ));
            }
            if policy.timeout_ms == Some(0) {
                return Err(invalid(
                    &format!("entities.{}.timeout_ms", entity),
                    "0".to_string(),
                    "timeout_ms must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> PulseError {
    PulseError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_retry_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(4_000));
    }

    #[test]
    fn test_should_retry_respects_error_kind() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&FetchError::server(500, "boom"), 1));
        assert!(policy.should_retry(&FetchError::server(500, "boom"), 3));
        assert!(!policy.should_retry(&FetchError::server(500, "boom"), 4));
        assert!(!policy.should_retry(&FetchError::server(404, "missing"), 1));
        assert!(!RetryPolicy::none().should_retry(&FetchError::network("reset"), 1));
    }

    #[test]
    fn test_dashboard_defaults_table() {
        let config = EngineConfig::dashboard_defaults();
        let queue = config.policy_for(entities::QUEUE_STATUS);
        assert_eq!(queue.interval(), Some(Duration::from_millis(3_000)));
        assert_eq!(queue.stale_after(), Duration::from_millis(2_000));

        let logs = config.policy_for(entities::PLUGIN_SYNC_LOGS);
        assert_eq!(logs.interval_ms, Some(30_000));
        assert_eq!(logs.stale_after_ms, 25_000);

        let slowest = config.policy_for(entities::AGENT_SLOWEST);
        assert_eq!(slowest.interval_ms, Some(90_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_entity_is_fetch_once() {
        let config = EngineConfig::default();
        let policy = config.policy_for("budgets");
        assert_eq!(policy.interval(), None);
        assert_eq!(config.timeout_for("budgets"), Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_prefers_view_options() {
        let config = EngineConfig::dashboard_defaults();
        let options = QueryOptions::new().with_interval(Duration::from_secs(1));
        let (interval, stale_after) = config.resolve(entities::TASK_LIST, &options);
        assert_eq!(interval, Some(Duration::from_secs(1)));
        assert_eq!(stale_after, Duration::from_millis(4_000));

        let (interval, _) = config.resolve(entities::TASK_LIST, &QueryOptions::new().fetch_once());
        assert_eq!(interval, None);
    }

    #[test]
    fn test_entity_timeout_override() {
        let config = EngineConfig::default()
            .with_entity("agent_trend", EntityPolicy::polled(60_000, 60_000).with_timeout_ms(15_000));
        assert_eq!(config.timeout_for("agent_trend"), Duration::from_secs(15));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().with_jitter_ratio(1.0).validate().is_err());
        assert!(EngineConfig::default().with_jitter_ratio(-0.1).validate().is_err());
        assert!(EngineConfig::default()
            .with_default_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_entity("tasks", EntityPolicy::polled(0, 0))
            .validate()
            .is_err());

        let mut config = EngineConfig::default();
        config.retry.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_poll_interval() {
        let week = EngineConfig::default().with_entity("archive", EntityPolicy::polled(MAX_INTERVAL_MS, 0));
        assert!(week.validate().is_ok());

        let err = EngineConfig::default()
            .with_entity("archive", EntityPolicy::polled(u64::MAX, 0))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("entities.archive.interval_ms"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_src = r#"
            gc_grace_ms = 30000
            jitter_ratio = 0.05

            [retry]
            max_retries = 2

            [entities.queue_status]
            interval_ms = 3000
            stale_after_ms = 2000

            [entities.budgets]
            stale_after_ms = 120000
            timeout_ms = 8000
        "#;
        let config: EngineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.gc_grace(), Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.policy_for("budgets").interval(), None);
        assert_eq!(config.timeout_for("budgets"), Duration::from_secs(8));
        assert!(config.validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_retry_delay_is_monotonic_and_capped(
            base in 1u64..2_000,
            extra in 0u64..10_000,
            factor in 1.0f64..4.0,
            retry in 1u32..20,
        ) {
            let policy = RetryPolicy {
                max_retries: 3,
                base_delay_ms: base,
                factor,
                max_delay_ms: base + extra,
            };
            let delay = policy.delay_for_retry(retry);
            let next = policy.delay_for_retry(retry + 1);
            prop_assert!(delay <= Duration::from_millis(base + extra));
            prop_assert!(delay >= Duration::from_millis(base));
            prop_assert!(next >= delay);
        }

        #[test]
        fn prop_valid_jitter_ratio_accepted(ratio in 0.0f64..0.99) {
            let config = EngineConfig::default().with_jitter_ratio(ratio);
            prop_assert!(config.validate().is_ok());
        }
    }
}
