//! Mounts the configured views and reports their changes.

use crate::config::{ConsoleConfig, ViewConfig};
use crate::error::ConsoleResult;
use pulse_engine::{
    EngineMetricsSnapshot, QueryFetcher, QueryHandle, QueryMutator, SyncEngine, ViewState,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running console: one engine plus a watcher task per view.
pub struct Console {
    engine: SyncEngine,
    watchers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Console {
    /// Build the engine, register the transport and mount every view.
    pub fn start(
        config: &ConsoleConfig,
        fetcher: Arc<dyn QueryFetcher>,
        mutator: Arc<dyn QueryMutator>,
    ) -> ConsoleResult<Self> {
        let engine = SyncEngine::new(config.engine.clone())?;
        engine.register_fallback_fetcher(fetcher);

        let entities: BTreeSet<&str> = config.views.iter().map(|v| v.entity.as_str()).collect();
        for entity in entities {
            engine.register_mutator(entity, Arc::clone(&mutator));
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut watchers = Vec::with_capacity(config.views.len());
        for view in &config.views {
            let handle = engine.query(&view.entity, &view.params(), view.query_options())?;
            tracing::info!(view = %view.name, key = %handle.key(), "View mounted");
            watchers.push(tokio::spawn(watch_view(
                view.clone(),
                handle,
                shutdown_tx.subscribe(),
            )));
        }

        Ok(Self {
            engine,
            watchers,
            shutdown_tx,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Unmount every view, stop the engine and return its final counters.
    pub async fn shutdown(self) -> EngineMetricsSnapshot {
        self.shutdown_tx.send_replace(true);
        for watcher in self.watchers {
            if let Err(e) = watcher.await {
                tracing::warn!(error = %e, "View watcher ended abnormally");
            }
        }
        self.engine.shutdown();
        self.engine.metrics()
    }
}

async fn watch_view(view: ViewConfig, mut handle: QueryHandle, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            changed = handle.changed() => {
                let Ok(version) = changed else {
                    break;
                };
                let snapshot = handle.snapshot();
                let state = snapshot.view_state();
                if state == ViewState::Failed {
                    tracing::warn!(
                        view = %view.name,
                        version,
                        error = ?snapshot.error.as_ref().map(|record| record.error.to_string()),
                        attempts = snapshot.error.as_ref().map(|record| record.attempts),
                        "View failed to load"
                    );
                } else {
                    tracing::info!(
                        view = %view.name,
                        version,
                        status = %snapshot.status,
                        state = ?state,
                        stale = snapshot.is_stale,
                        fetched_at = ?snapshot.fetched_at,
                        "View updated"
                    );
                }
            }
        }
    }
    tracing::debug!(view = %view.name, "View unmounted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_test_utils::{ScriptedFetcher, ScriptedMutator};
    use std::time::Duration;

    fn config() -> ConsoleConfig {
        ConsoleConfig::from_toml(
            r#"
            base_url = "http://localhost:8080"
            request_timeout_ms = 2000
            log_level = "info"

            [[views]]
            name = "queue"
            entity = "queue_status"

            [[views]]
            name = "failures"
            entity = "executions"
            params = { status = "failed" }
            fetch_once = true

            [[views]]
            name = "failure-badge"
            entity = "executions"
            params = { status = "failed" }
            fetch_once = true
            "#,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_mounts_views_and_shuts_down() {
        let config = config();
        let fetcher = Arc::new(ScriptedFetcher::new());
        let console = Console::start(&config, fetcher.clone(), Arc::new(ScriptedMutator::new())).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.calls_for("executions"), 1);
        assert_eq!(fetcher.calls_for("queue_status"), 1);
        assert!(console.engine().optimistic("queue_status", serde_json::json!({})).is_ok());

        let metrics = console.shutdown().await;
        assert_eq!(metrics.network_calls, 2);
        assert_eq!(metrics.deduplicated, 1);
    }
}
