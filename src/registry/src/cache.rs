//! Two-tier build cache.
//!
//! Build results are cached twice: in-process for fast hits, and in the
//! storage backend so that caches survive restarts and are shared
//! between replicas. Manifests can be large, so their bytes live in a
//! local scratch directory with only the paths held in memory; layer
//! descriptors are small JSON documents and stay in a map.
//!
//! Entries are only ever written after the corresponding data has been
//! persisted, so a cache hit implies the referenced blobs exist in the
//! backend.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use nixery_core::error::NixeryError;

use crate::manifest::{Entry, MANIFEST_TYPE};
use crate::storage::{Persister, StorageBackend};

/// In-process tier of the build cache.
pub struct BuildCache {
    /// Scratch directory for locally cached manifests. Holding the
    /// handle keeps the directory alive for the process lifetime.
    scratch: tempfile::TempDir,

    /// Manifest cache: build fingerprint to scratch file
    manifests: RwLock<HashMap<String, PathBuf>>,

    /// Layer descriptor cache, keyed by layer identity
    layers: RwLock<HashMap<String, Entry>>,
}

fn persist_bytes(bytes: Vec<u8>) -> Persister {
    Box::new(move |w: &mut dyn Write| {
        w.write_all(&bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
    })
}

impl BuildCache {
    pub fn new() -> nixery_core::Result<BuildCache> {
        let scratch = tempfile::Builder::new()
            .prefix("nixery")
            .tempdir()
            .map_err(|e| {
                NixeryError::Config(format!("failed to create manifest scratch dir: {}", e))
            })?;

        Ok(BuildCache {
            scratch,
            manifests: RwLock::new(HashMap::new()),
            layers: RwLock::new(HashMap::new()),
        })
    }

    async fn manifest_from_local(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.manifests.read().await.get(key).cloned()?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached manifest file unreadable");
                None
            }
        }
    }

    async fn manifest_to_local(&self, key: &str, manifest: &[u8]) {
        let path = self.scratch.path().join(key);

        match tokio::fs::write(&path, manifest).await {
            Ok(()) => {
                self.manifests.write().await.insert(key.to_string(), path);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to write manifest to scratch dir");
            }
        }
    }

    /// Retrieve a cached manifest, checking the local tier before the
    /// storage backend. A backend hit populates the local tier in the
    /// background.
    pub async fn manifest_from_cache(
        self: &Arc<Self>,
        storage: &Arc<dyn StorageBackend>,
        key: &str,
    ) -> Option<Vec<u8>> {
        if let Some(manifest) = self.manifest_from_local(key).await {
            tracing::debug!(key = %key, "manifest cache hit (local)");
            return Some(manifest);
        }

        match storage.fetch(&format!("manifests/{}", key)).await {
            Ok(manifest) => {
                tracing::info!(key = %key, backend = %storage.name(), "manifest cache hit (backend)");

                let cache = self.clone();
                let key = key.to_string();
                let bytes = manifest.clone();
                tokio::spawn(async move { cache.manifest_to_local(&key, &bytes).await });

                Some(manifest)
            }
            Err(NixeryError::NotFound { .. }) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "manifest cache probe failed");
                None
            }
        }
    }

    /// Add a built manifest to both cache tiers.
    pub async fn cache_manifest(
        self: &Arc<Self>,
        storage: &Arc<dyn StorageBackend>,
        key: &str,
        manifest: &[u8],
    ) {
        let local = self.manifest_to_local(key, manifest);

        let remote = async {
            let result = storage
                .persist(
                    &format!("manifests/{}", key),
                    MANIFEST_TYPE,
                    persist_bytes(manifest.to_vec()),
                )
                .await;

            match result {
                Ok((_, size)) => {
                    tracing::debug!(key = %key, size, "cached manifest in backend")
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to cache manifest in backend")
                }
            }
        };

        tokio::join!(local, remote);
    }

    /// Retrieve a cached layer descriptor.
    pub async fn layer_from_cache(
        self: &Arc<Self>,
        storage: &Arc<dyn StorageBackend>,
        key: &str,
    ) -> Option<Entry> {
        if let Some(entry) = self.layers.read().await.get(key).cloned() {
            return Some(entry);
        }

        match storage.fetch(&format!("builds/{}", key)).await {
            Ok(bytes) => match serde_json::from_slice::<Entry>(&bytes) {
                Ok(entry) => {
                    tracing::debug!(layer = %key, "layer cache hit (backend)");

                    let cache = self.clone();
                    let key = key.to_string();
                    let populate = entry.clone();
                    tokio::spawn(async move {
                        cache.layers.write().await.insert(key, populate);
                    });

                    Some(entry)
                }
                Err(e) => {
                    tracing::warn!(layer = %key, error = %e, "corrupt cached layer descriptor");
                    None
                }
            },
            Err(NixeryError::NotFound { .. }) => None,
            Err(e) => {
                tracing::warn!(layer = %key, error = %e, "layer cache probe failed");
                None
            }
        }
    }

    /// Add a layer build result to both cache tiers.
    pub async fn cache_layer(
        self: &Arc<Self>,
        storage: &Arc<dyn StorageBackend>,
        key: &str,
        entry: &Entry,
    ) {
        let local = async {
            self.layers
                .write()
                .await
                .insert(key.to_string(), entry.clone());
        };

        let remote = async {
            let json = match serde_json::to_vec(entry) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(layer = %key, error = %e, "failed to serialise layer descriptor");
                    return;
                }
            };

            if let Err(e) = storage
                .persist(
                    &format!("builds/{}", key),
                    "application/json",
                    persist_bytes(json),
                )
                .await
            {
                tracing::warn!(layer = %key, error = %e, "failed to cache layer in backend");
            }
        };

        tokio::join!(local, remote);
    }
}

/// A build failure retained for the index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildError {
    pub key: String,
    pub error: String,
}

struct RingState {
    order: VecDeque<String>,
    errors: HashMap<String, String>,
}

/// Bounded ring of recent build errors, newest first.
///
/// Purely informational: entries never block retries, they only feed the
/// index page. Adding a key that is already present is a no-op; once the
/// ring is full the oldest entry is evicted.
pub struct ErrorRing {
    capacity: usize,
    state: std::sync::RwLock<RingState>,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> ErrorRing {
        ErrorRing {
            capacity: capacity.max(1),
            state: std::sync::RwLock::new(RingState {
                order: VecDeque::new(),
                errors: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, key: &str, error: &str) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.errors.contains_key(key) {
            return;
        }

        if state.order.len() == self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.errors.remove(&oldest);
            }
        }

        state.order.push_back(key.to_string());
        state.errors.insert(key.to_string(), error.to_string());
    }

    pub fn recent(&self) -> Vec<BuildError> {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state
            .order
            .iter()
            .rev()
            .filter_map(|key| {
                state.errors.get(key).map(|error| BuildError {
                    key: key.clone(),
                    error: error.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBackend;
    use tempfile::TempDir;

    fn fs_backend(tmp: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(FsBackend::new(tmp.path().join("storage")).unwrap())
    }

    fn entry(digest: &str) -> Entry {
        Entry {
            digest: format!("sha256:{}", digest),
            size: 123,
            tar_hash: format!("sha256:tar-{}", digest),
            merge_rating: 42,
        }
    }

    #[tokio::test]
    async fn test_manifest_miss_is_none() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);
        let cache = Arc::new(BuildCache::new().unwrap());

        assert!(cache.manifest_from_cache(&storage, "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_manifest_roundtrip_via_backend() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);

        let cache = Arc::new(BuildCache::new().unwrap());
        cache
            .cache_manifest(&storage, "fingerprint", b"{\"manifest\":true}")
            .await;

        // A fresh cache instance has an empty local tier, so this hit
        // must come from the backend.
        let fresh = Arc::new(BuildCache::new().unwrap());
        let manifest = fresh
            .manifest_from_cache(&storage, "fingerprint")
            .await
            .unwrap();
        assert_eq!(manifest, b"{\"manifest\":true}");

        // And the backend object is byte-identical
        assert_eq!(
            storage.fetch("manifests/fingerprint").await.unwrap(),
            b"{\"manifest\":true}"
        );
    }

    #[tokio::test]
    async fn test_manifest_local_tier_hit() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);

        let cache = Arc::new(BuildCache::new().unwrap());
        cache.cache_manifest(&storage, "fp", b"bytes").await;

        let manifest = cache.manifest_from_cache(&storage, "fp").await.unwrap();
        assert_eq!(manifest, b"bytes");
    }

    #[tokio::test]
    async fn test_layer_roundtrip_via_backend() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);

        let cache = Arc::new(BuildCache::new().unwrap());
        let e = entry("abc");
        cache.cache_layer(&storage, "layer-key", &e).await;

        let fresh = Arc::new(BuildCache::new().unwrap());
        let cached = fresh.layer_from_cache(&storage, "layer-key").await.unwrap();
        assert_eq!(cached, e);
    }

    #[tokio::test]
    async fn test_layer_descriptor_preserves_rating_and_tar_hash() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);

        let cache = Arc::new(BuildCache::new().unwrap());
        cache.cache_layer(&storage, "k", &entry("abc")).await;

        let fresh = Arc::new(BuildCache::new().unwrap());
        let cached = fresh.layer_from_cache(&storage, "k").await.unwrap();
        assert_eq!(cached.merge_rating, 42);
        assert_eq!(cached.tar_hash, "sha256:tar-abc");
    }

    #[tokio::test]
    async fn test_corrupt_layer_descriptor_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let storage = fs_backend(&tmp);

        storage
            .persist("builds/bad", "application/json", persist_bytes(b"not json".to_vec()))
            .await
            .unwrap();

        let cache = Arc::new(BuildCache::new().unwrap());
        assert!(cache.layer_from_cache(&storage, "bad").await.is_none());
    }

    #[test]
    fn test_error_ring_newest_first() {
        let ring = ErrorRing::new(15);
        ring.add("a:latest", "first");
        ring.add("b:latest", "second");

        let errors = ring.recent();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].key, "b:latest");
        assert_eq!(errors[1].key, "a:latest");
    }

    #[test]
    fn test_error_ring_deduplicates_keys() {
        let ring = ErrorRing::new(15);
        ring.add("a:latest", "first");
        ring.add("a:latest", "changed");

        let errors = ring.recent();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, "first");
    }

    #[test]
    fn test_error_ring_evicts_oldest() {
        let ring = ErrorRing::new(3);
        for i in 0..5 {
            ring.add(&format!("img{}:latest", i), "nope");
        }

        let errors = ring.recent();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].key, "img4:latest");
        assert_eq!(errors[2].key, "img2:latest");
    }

    #[test]
    fn test_error_ring_minimum_capacity() {
        let ring = ErrorRing::new(0);
        ring.add("a", "x");
        ring.add("b", "y");

        let errors = ring.recent();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "b");
    }
}
