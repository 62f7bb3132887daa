//! Configuration loading for the Pulse console.
//!
//! Top-level fields are required unless marked optional. The `[engine]`
//! table falls back to the dashboard defaults when omitted.

use pulse_core::{EngineConfig, KeyCodec, PulseError, QueryOptions, MAX_INTERVAL_MS};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "PULSE_CONSOLE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Sent as `x-api-key` on every request.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "EngineConfig::dashboard_defaults")]
    pub engine: EngineConfig,
    pub views: Vec<ViewConfig>,
}

/// One view mounted at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewConfig {
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Overrides the entity's polling interval.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub fetch_once: bool,
}

impl ViewConfig {
    pub fn params(&self) -> Value {
        self.params.clone().unwrap_or(Value::Null)
    }

    pub fn query_options(&self) -> QueryOptions {
        let mut options = QueryOptions::new().for_view(self.name.clone());
        if let Some(interval_ms) = self.interval_ms {
            options = options.with_interval(Duration::from_millis(interval_ms));
        }
        if self.fetch_once {
            options = options.fetch_once();
        }
        options
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or PULSE_CONSOLE_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("Invalid engine configuration: {0}")]
    Engine(#[from] PulseError),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

impl ConsoleConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args(std::env::args().skip(1)).or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(invalid("base_url", "must not be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid("base_url", "must start with http:// or https://"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be > 0"));
        }
        if self.log_level.trim().is_empty() {
            return Err(invalid("log_level", "must not be empty"));
        }
        if matches!(&self.api_key, Some(key) if key.trim().is_empty()) {
            return Err(invalid("api_key", "must not be empty when set"));
        }
        if self.views.is_empty() {
            return Err(invalid("views", "at least one view is required"));
        }

        self.engine.validate()?;

        let mut names = std::collections::HashSet::new();
        for (index, view) in self.views.iter().enumerate() {
            let field = |name: &str| format!("views[{}].{}", index, name);
            if view.name.trim().is_empty() {
                return Err(invalid(field("name"), "must not be empty"));
            }
            if !names.insert(view.name.as_str()) {
                return Err(invalid(field("name"), format!("duplicate view '{}'", view.name)));
            }
            if view.interval_ms == Some(0) {
                return Err(invalid(field("interval_ms"), "must be > 0"));
            }
            if view.interval_ms.is_some_and(|ms| ms > MAX_INTERVAL_MS) {
                return Err(invalid(field("interval_ms"), "must be at most one week"));
            }
            if view.fetch_once && view.interval_ms.is_some() {
                return Err(invalid(field("fetch_once"), "conflicts with interval_ms"));
            }
            KeyCodec::encode(&view.entity, &view.params())
                .map_err(|e| invalid(field("params"), e.to_string()))?;
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

/// Value following `--config` in the argument list.
pub fn config_path_from_args<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}
