//! # Beacon
//!
//! Hosts a broadcast station across a pool of event-loop threads.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Configure from ./beacon.toml, /etc/beacon/beacon.toml or
//! # ~/.config/beacon/beacon.toml
//!
//! # Run with environment variables
//! BEACON_LOOPS=4 BEACON_TICK_MS=250 beacon
//! ```

mod config;
mod host;
mod metrics;
mod shutdown;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,beacon_core=debug,beacon_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Beacon with {} loops, ticking every {}ms",
        config.loops,
        config.tick_ms
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let host = host::Host::start(config)?;
    host.spawn_consumers()?;
    host.run().await?;
    host.shutdown();

    Ok(())
}
