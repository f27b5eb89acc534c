//! Startup download of the package popularity table.

use nixery_core::error::{NixeryError, Result};

use crate::layers::Popularity;

/// Download the popularity table from the configured URL.
///
/// The table maps package short names to their ecosystem-wide reference
/// counts and drives the layer promotion heuristic. Called once at
/// startup; a failure here is a configuration problem.
pub async fn fetch_popularity(url: &str) -> Result<Popularity> {
    tracing::info!(url = %url, "fetching popularity data");

    let resp = reqwest::get(url).await.map_err(|e| {
        NixeryError::Config(format!("popularity download from '{}' failed: {}", url, e))
    })?;

    if !resp.status().is_success() {
        return Err(NixeryError::Config(format!(
            "popularity download from '{}' returned status {}",
            url,
            resp.status()
        )));
    }

    let pop: Popularity = resp.json().await.map_err(|e| {
        NixeryError::Config(format!("invalid popularity data from '{}': {}", url, e))
    })?;

    tracing::info!(packages = pop.len(), "loaded popularity data");

    Ok(pop)
}
