//! labmon server binary.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use labmon_server::{run_server, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load().context("loading configuration")?;

    // RUST_LOG wins; the config file provides the default filter.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(data_dir = %config.data_dir.display(), "starting labmon");
    let state = Arc::new(
        AppState::init(&config)
            .await
            .context("initializing services")?,
    );

    run_server(&config, state).await
}
