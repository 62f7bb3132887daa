//! Pulse console entry point.

use pulse_console::{logging, Console, ConsoleConfig, ConsoleError, RestClient, RestFetcher, RestMutator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), ConsoleError> {
    let config = ConsoleConfig::load()?;
    logging::init(&config)?;

    let client = Arc::new(RestClient::new(&config)?);
    let console = Console::start(
        &config,
        Arc::new(RestFetcher::new(Arc::clone(&client))),
        Arc::new(RestMutator::new(client)),
    )?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");

    let metrics = console.shutdown().await;
    tracing::info!(
        network_calls = metrics.network_calls,
        deduplicated = metrics.deduplicated,
        retries = metrics.retries,
        stale_responses_discarded = metrics.stale_responses_discarded,
        fetch_failures = metrics.fetch_failures,
        ticks_fired = metrics.ticks_fired,
        ticks_skipped_paused = metrics.ticks_skipped_paused,
        evictions = metrics.evictions,
        "Console stopped"
    );
    Ok(())
}
