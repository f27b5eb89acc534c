//! Popcount fetches popularity information for each store path in a
//! given channel from the upstream binary cache.
//!
//! It does this simply by inspecting the narinfo files, rather than
//! attempting to instantiate the binary cache locally, which is
//! significantly faster than realising the whole channel and asking the
//! resolver for path info.
//!
//! The resulting table maps package short names to the number of other
//! packages that reference them and feeds the registry's layer
//! promotion heuristic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use clap::Parser;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Concurrent narinfo downloads.
const DOWNLOADERS: usize = 42;

#[derive(Parser, Debug)]
#[command(name = "nixery-popcount", about = "Compute package popularity for a channel")]
struct Args {
    /// Channel to count package popularity for (e.g. nixos-unstable)
    channel: String,

    /// Directory for caching downloaded narinfo files
    #[arg(long, default_value = "popcache")]
    cache_dir: PathBuf,
}

/// Pinned metadata of a channel release.
#[derive(Debug)]
struct ChannelMeta {
    name: String,
    url: String,
    commit: String,
}

/// One store path of the channel, split into its hash and name parts.
#[derive(Debug, Clone, PartialEq)]
struct Item {
    hash: String,
    name: String,
}

fn store_path_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new("/nix/store/([a-z0-9]{32})-(.*)$").unwrap())
}

fn refs_line_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new("(?m:^References: (.*)$)").unwrap())
}

fn ref_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new("^([a-z0-9]{32})-(.*)$").unwrap())
}

fn store_path_to_item(path: &str) -> Option<Item> {
    let captures = store_path_regex().captures(path)?;
    Some(Item {
        hash: captures[1].to_string(),
        name: captures[2].to_string(),
    })
}

/// Extract the short names referenced by a narinfo file.
fn narinfo_refs(narinfo: &str) -> Vec<String> {
    let line = match refs_line_regex().captures(narinfo) {
        Some(captures) => captures[1].to_string(),
        None => return Vec::new(),
    };

    line.split(' ')
        .filter(|r| !r.is_empty())
        .filter_map(|r| ref_regex().captures(r).map(|c| c[2].to_string()))
        .collect()
}

/// Count how often each package name is referenced across all narinfos,
/// dropping packages only referenced by themselves.
fn count_references<'a>(narinfos: impl Iterator<Item = &'a str>) -> HashMap<String, u64> {
    let mut counts: HashMap<String, u64> = HashMap::new();

    for narinfo in narinfos {
        for reference in narinfo_refs(narinfo) {
            *counts.entry(reference).or_insert(0) += 1;
        }
    }

    counts.retain(|_, count| *count > 1);
    counts
}

/// Resolve the channel name to its current release URL and commit.
async fn channel_metadata(channel: &str) -> Result<ChannelMeta, String> {
    // Redirects must not be followed: the redirect target is the
    // release URL used for all further downloads.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| format!("failed to construct HTTP client: {}", e))?;

    let resp = client
        .get(format!("https://nixos.org/channels/{}", channel))
        .send()
        .await
        .map_err(|e| format!("failed to retrieve channel metadata: {}", e))?;

    if !resp.status().is_redirection() {
        return Err(format!(
            "expected redirect for channel, but received {}",
            resp.status()
        ));
    }

    let url = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|l| l.to_str().ok())
        .map(|l| l.trim_end_matches('/').to_string())
        .ok_or("no redirect location given for channel")?;

    let commit = client
        .get(format!("{}/git-revision", url))
        .send()
        .await
        .map_err(|e| format!("failed to retrieve commit for channel: {}", e))?
        .text()
        .await
        .map_err(|e| format!("failed to read commit from response: {}", e))?;

    Ok(ChannelMeta {
        name: channel.to_string(),
        url,
        commit: commit.trim().to_string(),
    })
}

/// Download and decompress the channel's store path listing.
///
/// Decompression runs through `xzcat`, which spares us from carrying a
/// whole LZMA implementation for a single file.
async fn download_store_paths(meta: &ChannelMeta) -> Result<Vec<String>, String> {
    let compressed = reqwest::get(format!("{}/store-paths.xz", meta.url))
        .await
        .map_err(|e| format!("failed to download store-paths.xz: {}", e))?
        .bytes()
        .await
        .map_err(|e| format!("failed to download store-paths.xz: {}", e))?;

    let mut child = tokio::process::Command::new("xzcat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start xzcat: {}", e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or("xzcat stdin was not captured")?;
    tokio::spawn(async move {
        let _ = stdin.write_all(&compressed).await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("xzcat failed: {}", e))?;
    if !output.status.success() {
        return Err(format!("xzcat failed to decompress: {}", output.status));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.to_string())
        .collect())
}

/// Fetch one narinfo, preferring the local cache directory.
async fn fetch_narinfo(
    client: &reqwest::Client,
    cache_dir: &std::path::Path,
    item: &Item,
) -> Result<String, String> {
    let cached = cache_dir.join(&item.hash);
    if let Ok(narinfo) = tokio::fs::read_to_string(&cached).await {
        return Ok(narinfo);
    }

    let narinfo = client
        .get(format!("https://cache.nixos.org/{}.narinfo", item.hash))
        .send()
        .await
        .map_err(|e| format!("couldn't fetch narinfo for {}: {}", item.name, e))?
        .error_for_status()
        .map_err(|e| format!("couldn't fetch narinfo for {}: {}", item.name, e))?
        .text()
        .await
        .map_err(|e| format!("couldn't read narinfo for {}: {}", item.name, e))?;

    // Best-effort cache write
    let _ = tokio::fs::write(&cached, &narinfo).await;

    Ok(narinfo)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    std::fs::create_dir_all(&args.cache_dir)?;

    tracing::info!(channel = %args.channel, "fetching channel metadata");
    let meta = channel_metadata(&args.channel).await?;
    tracing::info!(channel = %meta.name, commit = %meta.commit, "pinned channel");

    let paths = download_store_paths(&meta).await?;
    tracing::info!(paths = paths.len(), "fetching references for store paths");

    let client = reqwest::Client::new();
    let semaphore = Arc::new(Semaphore::new(DOWNLOADERS));
    let cache_dir = Arc::new(args.cache_dir.clone());

    let mut downloads: JoinSet<Option<String>> = JoinSet::new();
    for path in &paths {
        let Some(item) = store_path_to_item(path) else {
            continue;
        };

        let client = client.clone();
        let semaphore = semaphore.clone();
        let cache_dir = cache_dir.clone();
        downloads.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            match fetch_narinfo(&client, &cache_dir, &item).await {
                Ok(narinfo) => Some(narinfo),
                Err(e) => {
                    tracing::warn!("{}", e);
                    None
                }
            }
        });
    }

    let mut narinfos = Vec::new();
    while let Some(result) = downloads.join_next().await {
        if let Ok(Some(narinfo)) = result {
            narinfos.push(narinfo);
        }
    }

    let counts = count_references(narinfos.iter().map(|n| n.as_str()));

    let outfile = format!("popularity-{}-{}.json", meta.name, meta.commit);
    std::fs::write(&outfile, serde_json::to_vec(&counts)?)?;
    tracing::info!(outfile = %outfile, packages = counts.len(), "wrote output");

    Ok(())
}
