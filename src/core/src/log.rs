//! Logging initialisation.
//!
//! Logs are emitted as structured JSON lines on stdout so that they can be
//! ingested directly by log collectors. The filter defaults to `info` and
//! can be overridden through `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// `version` is recorded on the startup event so that every deployment's
/// log stream identifies the running build.
pub fn init(version: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_current_span(false)
        .init();

    tracing::info!(service = "nixery", version = %version, "initialised logging");
}
