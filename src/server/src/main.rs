//! Nixery server binary.
//!
//! Wires configuration, storage, caches and popularity data together
//! and serves the registry API.

use std::sync::Arc;

use nixery_core::config::Config;
use nixery_registry::popularity::fetch_popularity;
use nixery_registry::{storage, Popularity, State};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    nixery_core::log::init(nixery_core::VERSION);

    let config = Config::from_env()?;

    let backend = storage::from_config(&config)?;
    tracing::info!(backend = %backend.name(), "initialised storage backend");

    let pop = match &config.pop_url {
        Some(url) => fetch_popularity(url).await?,
        None => Popularity::new(),
    };

    let port = config.port;
    let state = Arc::new(State::new(config, backend, pop)?);

    tracing::info!(version = %nixery_core::VERSION, port, "starting Nixery");

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, nixery_server::router(state)).await?;

    Ok(())
}
