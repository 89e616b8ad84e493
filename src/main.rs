//! unified-db - Main entry point.
//!
//! Builds the database client from CLI/environment configuration, bootstraps
//! the migrations table and serves the health/stats endpoint until shutdown.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use unified_db::client::DatabaseClient;
use unified_db::config::Config;
use unified_db::server::MonitorServer;

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    info!(
        backend = %config.backend,
        "Starting unified-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Arc::new(DatabaseClient::from_config(&config)?);

    if let Err(e) = client.run_migrations().await {
        error!(error = %e, "Migration bootstrap failed");
        client.close_all().await;
        return Err(e.into());
    }

    let server = MonitorServer::new(Arc::clone(&client), &config.http_host, config.http_port);
    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        client.close_all().await;
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
