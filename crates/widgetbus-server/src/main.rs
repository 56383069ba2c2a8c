//! # widgetbus server
//!
//! Room-scoped broadcast server for widgetbus relay clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! widgetbus
//!
//! # Run with a specific config file
//! widgetbus --config /path/to/widgetbus.toml
//!
//! # Persist to Redis
//! WIDGETBUS_STORE__BACKEND=redis widgetbus
//!
//! # Bind elsewhere
//! WIDGETBUS_PORT=8080 WIDGETBUS_HOST=0.0.0.0 widgetbus
//! ```

mod config;
mod handlers;
mod metrics;
mod redis_store;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "widgetbus=debug,widgetbus_core=debug,widgetbus_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().skip_while(|arg| arg != "--config").nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting widgetbus server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
