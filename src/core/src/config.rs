//! Runtime configuration for the registry, loaded from the environment.
//!
//! Nixery is configured exclusively through environment variables, which
//! keeps it deployable as a single container with no config files. The
//! package source is selected by setting exactly one of `NIXERY_CHANNEL`,
//! `NIXERY_PKGS_REPO` or `NIXERY_PKGS_PATH`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{NixeryError, Result};

/// Matches git references that are full commit hashes, as opposed to
/// branch or tag names.
///
/// Only commit hashes identify an immutable package set, so only they
/// participate in build caching. A branch or tag deliberately named like
/// a commit will defeat this heuristic.
fn is_commit_ref(r: &str) -> bool {
    r.len() == 40 && r.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Source from which the Nix package set is imported.
///
/// Each variant renders to the `(srcType, srcArgs)` pair understood by the
/// resolver, and produces a cache fingerprint when (and only when) the
/// underlying source is content-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PkgSource {
    /// A Nix channel name, or a nixpkgs commit hash
    Channel { name: String },

    /// A git repository containing a package set
    Git { url: String },

    /// A local filesystem path to a package set checkout
    Path { path: String },
}

impl PkgSource {
    /// Render the source into the `(srcType, srcArgs)` argument pair
    /// passed to the resolver.
    pub fn render(&self, tag: &str) -> (String, String) {
        match self {
            PkgSource::Channel { name } => ("nixpkgs".to_string(), name.clone()),
            PkgSource::Git { url } => {
                // The git source requires a ref. Images tagged 'latest'
                // (or untagged) build from the default branch.
                let tag = if tag.is_empty() || tag == "latest" {
                    "master"
                } else {
                    tag
                };

                let key = if is_commit_ref(tag) { "rev" } else { "ref" };
                let args = serde_json::json!({ "url": url, key: tag });

                ("git".to_string(), args.to_string())
            }
            PkgSource::Path { path } => ("path".to_string(), path.clone()),
        }
    }

    /// Compute the fingerprint under which builds from this source are
    /// cached.
    ///
    /// `None` means the source is a moving target (channel name, git
    /// branch, local path) and the build must not be cached.
    pub fn cache_key(&self, pkgs: &[String], tag: &str) -> Option<String> {
        let stable_ref = match self {
            PkgSource::Channel { name } => {
                // Channels resolve through the nixpkgs mirror, which also
                // accepts full commit hashes. Only those are stable.
                if !is_commit_ref(name) {
                    return None;
                }
                name.as_str()
            }
            PkgSource::Git { url: _ } => {
                if !is_commit_ref(tag) {
                    return None;
                }
                tag
            }
            // No cheap content hash exists for a local checkout.
            PkgSource::Path { .. } => return None,
        };

        let mut hasher = Sha1::new();
        for pkg in pkgs {
            hasher.update(pkg.as_bytes());
        }
        hasher.update(stable_ref.as_bytes());

        Some(hex::encode(hasher.finalize()))
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    S3,
}

/// Nixery configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port on which to serve the registry API
    pub port: u16,

    /// Directory with static web assets
    pub web_dir: PathBuf,

    /// Source for the Nix package set
    pub pkgs: PkgSource,

    /// Storage backend to use for layers and manifests
    pub backend: StorageKind,

    /// Timeout for a single resolver invocation, in seconds
    pub timeout: u64,

    /// URL of the package popularity table; empty disables
    /// popularity-based layer promotion
    pub pop_url: Option<String>,

    /// Resolver program invoked to realise package closures
    pub builder: String,
}

fn require_env(key: &str, desc: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NixeryError::Config(format!("{} must be set ({})", key, desc)))
}

fn pkg_source_from_env() -> Result<PkgSource> {
    if let Ok(name) = std::env::var("NIXERY_CHANNEL") {
        if !name.is_empty() {
            tracing::info!(channel = %name, "using package set from Nix channel or commit");
            return Ok(PkgSource::Channel { name });
        }
    }

    if let Ok(url) = std::env::var("NIXERY_PKGS_REPO") {
        if !url.is_empty() {
            tracing::info!(repo = %url, "using package set from git repository");
            return Ok(PkgSource::Git { url });
        }
    }

    if let Ok(path) = std::env::var("NIXERY_PKGS_PATH") {
        if !path.is_empty() {
            tracing::info!(path = %path, "using package set at local path");
            return Ok(PkgSource::Path { path });
        }
    }

    Err(NixeryError::Config(
        "no package source specified: set NIXERY_CHANNEL, NIXERY_PKGS_REPO or NIXERY_PKGS_PATH"
            .to_string(),
    ))
}

impl Config {
    /// Load the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let backend = match require_env("NIXERY_STORAGE_BACKEND", "storage backend")?.as_str() {
            "filesystem" => StorageKind::Filesystem,
            "s3" => StorageKind::S3,
            other => {
                return Err(NixeryError::Config(format!(
                    "NIXERY_STORAGE_BACKEND must be one of 'filesystem', 's3' (got '{}')",
                    other
                )))
            }
        };

        let port = require_env("PORT", "HTTP port")?
            .parse::<u16>()
            .map_err(|e| NixeryError::Config(format!("PORT is not a valid port number: {}", e)))?;

        let timeout = match std::env::var("NIX_TIMEOUT") {
            Ok(t) if !t.is_empty() => t.parse::<u64>().map_err(|e| {
                NixeryError::Config(format!("NIX_TIMEOUT is not a valid duration: {}", e))
            })?,
            _ => 60,
        };

        Ok(Config {
            port,
            web_dir: PathBuf::from(require_env("WEB_DIR", "static web asset dir")?),
            pkgs: pkg_source_from_env()?,
            backend,
            timeout,
            pop_url: std::env::var("NIX_POPULARITY_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            builder: std::env::var("NIX_BUILDER")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "nixery-prepare-image".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: &str = "3f5b1f51ecb3fdd80b191d4a09a4d8a1a9a116e3";

    fn pkgs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_channel_render() {
        let src = PkgSource::Channel {
            name: "nixos-unstable".to_string(),
        };
        let (ty, args) = src.render("latest");
        assert_eq!(ty, "nixpkgs");
        assert_eq!(args, "nixos-unstable");
    }

    #[test]
    fn test_git_render_branch_ref() {
        let src = PkgSource::Git {
            url: "https://github.com/NixOS/nixpkgs".to_string(),
        };
        let (ty, args) = src.render("release-25.05");
        assert_eq!(ty, "git");

        let parsed: serde_json::Value = serde_json::from_str(&args).unwrap();
        assert_eq!(parsed["url"], "https://github.com/NixOS/nixpkgs");
        assert_eq!(parsed["ref"], "release-25.05");
    }

    #[test]
    fn test_git_render_commit_rev() {
        let src = PkgSource::Git {
            url: "https://github.com/NixOS/nixpkgs".to_string(),
        };
        let (_, args) = src.render(COMMIT);

        let parsed: serde_json::Value = serde_json::from_str(&args).unwrap();
        assert_eq!(parsed["rev"], COMMIT);
        assert!(parsed.get("ref").is_none());
    }

    #[test]
    fn test_git_render_latest_becomes_master() {
        let src = PkgSource::Git {
            url: "https://example.com/pkgs.git".to_string(),
        };
        let (_, args) = src.render("latest");

        let parsed: serde_json::Value = serde_json::from_str(&args).unwrap();
        assert_eq!(parsed["ref"], "master");
    }

    #[test]
    fn test_path_render() {
        let src = PkgSource::Path {
            path: "/home/user/nixpkgs".to_string(),
        };
        let (ty, args) = src.render("latest");
        assert_eq!(ty, "path");
        assert_eq!(args, "/home/user/nixpkgs");
    }

    #[test]
    fn test_cache_key_requires_commit_tag_for_git() {
        let src = PkgSource::Git {
            url: "https://example.com/pkgs.git".to_string(),
        };

        assert!(src.cache_key(&pkgs(&["hello"]), "master").is_none());
        assert!(src.cache_key(&pkgs(&["hello"]), "latest").is_none());
        assert!(src.cache_key(&pkgs(&["hello"]), COMMIT).is_some());
    }

    #[test]
    fn test_cache_key_requires_commit_channel() {
        let channel = PkgSource::Channel {
            name: "nixos-unstable".to_string(),
        };
        assert!(channel.cache_key(&pkgs(&["hello"]), "latest").is_none());

        let pinned = PkgSource::Channel {
            name: COMMIT.to_string(),
        };
        assert!(pinned.cache_key(&pkgs(&["hello"]), "latest").is_some());
    }

    #[test]
    fn test_cache_key_path_never_cacheable() {
        let src = PkgSource::Path {
            path: "/pkgs".to_string(),
        };
        assert!(src.cache_key(&pkgs(&["hello"]), COMMIT).is_none());
    }

    #[test]
    fn test_cache_key_depends_on_packages_and_tag() {
        let src = PkgSource::Git {
            url: "https://example.com/pkgs.git".to_string(),
        };

        let a = src.cache_key(&pkgs(&["git", "htop"]), COMMIT).unwrap();
        let b = src.cache_key(&pkgs(&["git"]), COMMIT).unwrap();
        assert_ne!(a, b);

        let c = src.cache_key(&pkgs(&["git", "htop"]), COMMIT).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_commit_ref_detection() {
        assert!(is_commit_ref(COMMIT));
        assert!(!is_commit_ref("master"));
        assert!(!is_commit_ref("3f5b1f5"));
        // Uppercase hex is not a canonical git hash
        assert!(!is_commit_ref(&COMMIT.to_uppercase()));
    }
}
