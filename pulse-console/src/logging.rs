//! Tracing subscriber setup.

use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` when set and valid, else the configured level.
pub fn env_filter(log_level: &str) -> ConsoleResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level).map_err(|e| ConsoleError::Logging(e.to_string())),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &ConsoleConfig) -> ConsoleResult<()> {
    let filter = env_filter(&config.log_level)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| ConsoleError::Logging(e.to_string()))?;

    tracing::info!(
        base_url = %config.base_url,
        views = config.views.len(),
        json_logs = config.json_logs,
        "Logging initialized"
    );
    Ok(())
}
