//! The image build orchestrator.
//!
//! Drives an image request end to end: consult the manifest cache,
//! invoke the resolver, group the closure into layers, pack and upload
//! whatever is missing, assemble the manifest and populate the caches.
//!
//! Concurrent requests for the same uncached content are coordinated
//! through keyed locks, one per manifest fingerprint and one per layer
//! identity, so that no build or upload ever runs twice at the same
//! time.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use nixery_core::config::Config;
use nixery_core::error::{NixeryError, Result};

use crate::archive;
use crate::cache::{BuildCache, ErrorRing};
use crate::image::Image;
use crate::layers::{self, package_from_path, Popularity, RuntimeGraph};
use crate::manifest::{self, Entry};
use crate::nix::{self, SymlinkLayer};
use crate::storage::{Persister, StorageBackend};

/// The maximum number of layers in an image is 125; building up to this
/// limit leaves no room for extensions, so the number of layers the
/// grouper may allocate is capped well below it. The symlink layer and
/// the image configuration occupy two more slots.
pub const LAYER_BUDGET: usize = 94;

/// Map of per-key async locks. The classic single-flight pattern: the
/// first caller for a key builds, everyone else waits and then hits the
/// cache.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let mut locks = self.locks.lock().await;

        // Entries nobody holds or waits for anymore are dead weight;
        // a later caller simply re-creates them.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = locks.entry(key.to_string()).or_default().clone();
        drop(locks);

        lock.lock_owned().await
    }
}

/// Runtime state carried through every build.
pub struct State {
    pub storage: Arc<dyn StorageBackend>,
    pub cache: Arc<BuildCache>,
    pub config: Config,
    pub pop: Popularity,
    pub errors: Arc<ErrorRing>,

    build_locks: KeyedLocks,
    upload_locks: KeyedLocks,
}

impl State {
    pub fn new(config: Config, storage: Arc<dyn StorageBackend>, pop: Popularity) -> Result<State> {
        Ok(State {
            storage,
            cache: Arc::new(BuildCache::new()?),
            config,
            pop,
            errors: Arc::new(ErrorRing::new(15)),
            build_locks: KeyedLocks::default(),
            upload_locks: KeyedLocks::default(),
        })
    }
}

/// Counts and hashes everything written through it on the way into the
/// storage sink. This is where the digest of the compressed layer as
/// served comes from.
struct HashingSink<'a> {
    inner: &'a mut dyn Write,
    hasher: Sha256,
    count: u64,
}

impl<'a> HashingSink<'a> {
    fn new(inner: &'a mut dyn Write) -> HashingSink<'a> {
        HashingSink {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.count)
    }
}

impl Write for HashingSink<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write_all(buf)?;
        self.hasher.update(buf);
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Upload a blob to the storage backend while hashing it.
///
/// The upload initially lands in the staging prefix, since the content
/// hash is only known once the writer has run; afterwards the object is
/// renamed to its content-addressed location. Nothing is cached here;
/// that is the caller's decision.
async fn upload_hash_layer<F>(
    state: &Arc<State>,
    key: &str,
    content_type: &'static str,
    write_layer: F,
) -> Result<Entry>
where
    F: FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
{
    let staging = format!("staging/{}", key);

    let persister: Persister = Box::new(move |sink: &mut dyn Write| {
        let mut hashing = HashingSink::new(sink);
        write_layer(&mut hashing)?;
        hashing.flush()?;
        Ok(hashing.finish())
    });

    let (sha256, size) = state
        .storage
        .persist(&staging, content_type, persister)
        .await
        .map_err(|e| {
            tracing::error!(layer = %key, backend = %state.storage.name(), error = %e, "failed to create and store layer");
            e
        })?;

    // Hashes are known and the blob is in the backend; move it to its
    // final content-addressed location.
    state
        .storage
        .rename(&staging, &format!("layers/{}", sha256))
        .await
        .map_err(|e| {
            tracing::error!(layer = %key, error = %e, "failed to move layer out of staging");
            e
        })?;

    tracing::info!(layer = %key, sha256 = %sha256, size, "created and persisted layer");

    Ok(Entry {
        digest: format!("sha256:{}", sha256),
        size,
        tar_hash: String::new(),
        merge_rating: 0,
    })
}

/// Build or reuse one grouped layer.
async fn prepare_grouped_layer(state: &Arc<State>, layer: layers::Layer) -> Result<Entry> {
    let key = layer.hash();

    if let Some(entry) = state.cache.layer_from_cache(&state.storage, &key).await {
        return Ok(entry);
    }

    let _guard = state.upload_locks.acquire(&key).await;
    if let Some(entry) = state.cache.layer_from_cache(&state.storage, &key).await {
        return Ok(entry);
    }

    // The SHA of the uncompressed tar stream is computed inside the
    // packer while the upload runs; it escapes through this slot.
    let tar_hash = Arc::new(std::sync::Mutex::new(None::<String>));

    let slot = tar_hash.clone();
    let contents = layer.clone();
    let mut entry = upload_hash_layer(state, &key, manifest::LAYER_TYPE, move |w| {
        let hash = archive::pack_store_paths(&contents, w)?;
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(hash);
        }
        Ok(())
    })
    .await?;

    entry.merge_rating = layer.merge_rating;
    entry.tar_hash = tar_hash
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .map(|hash| format!("sha256:{}", hash))
        .ok_or_else(|| NixeryError::Packing("layer packer produced no tar hash".to_string()))?;

    let packages: Vec<&str> = layer.contents.iter().map(|p| package_from_path(p)).collect();
    tracing::info!(
        layer = %key,
        packages = ?packages,
        tar_hash = %entry.tar_hash,
        "created image layer"
    );

    state.cache.cache_layer(&state.storage, &key, &entry).await;

    Ok(entry)
}

/// Compress and upload the resolver-built symlink layer, or reuse the
/// cached build. Its tarball already exists on local disk.
async fn prepare_symlink_layer(state: &Arc<State>, symlink: &SymlinkLayer) -> Result<Entry> {
    let key = symlink.tar_hash.clone();

    if let Some(entry) = state.cache.layer_from_cache(&state.storage, &key).await {
        return Ok(entry);
    }

    let _guard = state.upload_locks.acquire(&key).await;
    if let Some(entry) = state.cache.layer_from_cache(&state.storage, &key).await {
        return Ok(entry);
    }

    let path = symlink.path.clone();
    let mut entry = upload_hash_layer(state, &key, manifest::LAYER_TYPE, move |w| {
        let file = std::fs::File::open(&path).map_err(|e| {
            NixeryError::Packing(format!(
                "failed to open symlink layer {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut gz = GzEncoder::new(w, Compression::default());
        std::io::copy(&mut BufReader::new(file), &mut gz).map_err(|e| {
            NixeryError::Packing(format!("failed to compress symlink layer: {}", e))
        })?;
        gz.finish()
            .map_err(|e| NixeryError::Packing(format!("failed to compress symlink layer: {}", e)))?;

        Ok(())
    })
    .await?;

    entry.tar_hash = format!("sha256:{}", symlink.tar_hash);

    state.cache.cache_layer(&state.storage, &key, &entry).await;

    Ok(entry)
}

/// Group the closure into layers and make sure each one exists in the
/// backend, reusing cached builds wherever possible.
async fn prepare_layers(
    state: &Arc<State>,
    graph: &RuntimeGraph,
    symlink: &SymlinkLayer,
) -> Result<Vec<Entry>> {
    let grouped = layers::group(graph, &state.pop, LAYER_BUDGET - 2);

    let mut entries = Vec::with_capacity(grouped.len() + 1);
    for layer in grouped {
        entries.push(prepare_grouped_layer(state, layer).await?);
    }

    entries.push(prepare_symlink_layer(state, symlink).await?);

    Ok(entries)
}

/// Build an image and return its serialised manifest.
///
/// Missing packages surface as
/// [`NixeryError::PackagesNotFound`]; everything else that can go wrong
/// during resolution, packing or upload is an internal failure.
pub async fn build_image(state: &Arc<State>, image: &Image) -> Result<Vec<u8>> {
    let cache_key = state.config.pkgs.cache_key(&image.packages, &image.tag);

    let _build_guard = match &cache_key {
        Some(key) => {
            if let Some(manifest) = state.cache.manifest_from_cache(&state.storage, key).await {
                return Ok(manifest);
            }

            let guard = state.build_locks.acquire(key).await;

            // A previous holder of the lock may have completed this
            // exact build while we waited.
            if let Some(manifest) = state.cache.manifest_from_cache(&state.storage, key).await {
                return Ok(manifest);
            }

            Some(guard)
        }
        None => None,
    };

    let result = nix::prepare_image(&state.config, image).await?;

    if !result.error.is_empty() {
        if result.error == "not_found" {
            return Err(NixeryError::PackagesNotFound { pkgs: result.pkgs });
        }

        return Err(NixeryError::Resolver {
            message: format!("resolver reported error: {}", result.error),
        });
    }

    let graph = result.runtime_graph.as_ref().ok_or_else(|| NixeryError::Resolver {
        message: "resolver output is missing the runtime graph".to_string(),
    })?;
    let symlink = result.symlink_layer.as_ref().ok_or_else(|| NixeryError::Resolver {
        message: "resolver output is missing the symlink layer".to_string(),
    })?;

    let entries = prepare_layers(state, graph, symlink).await?;

    let (manifest_bytes, config) = manifest::manifest(image.arch.image_arch(), entries);

    let config_bytes = config.config;
    upload_hash_layer(state, &config.sha256, manifest::CONFIG_TYPE, move |w| {
        w.write_all(&config_bytes).map_err(NixeryError::from)
    })
    .await
    .map_err(|e| {
        tracing::error!(image = %image.name, tag = %image.tag, error = %e, "failed to upload image config");
        e
    })?;

    if let Some(key) = &cache_key {
        state
            .cache
            .cache_manifest(&state.storage, key, &manifest_bytes)
            .await;
    }

    Ok(manifest_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBackend;
    use nixery_core::config::{PkgSource, StorageKind};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn test_state(tmp: &TempDir) -> Arc<State> {
        state_with_resolver(tmp, "nixery-prepare-image")
    }

    fn state_with_resolver(tmp: &TempDir, builder: &str) -> Arc<State> {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(FsBackend::new(tmp.path().join("storage")).unwrap());

        let config = Config {
            port: 0,
            web_dir: tmp.path().to_path_buf(),
            pkgs: PkgSource::Channel {
                name: "nixos-unstable".to_string(),
            },
            backend: StorageKind::Filesystem,
            timeout: 5,
            pop_url: None,
            builder: builder.to_string(),
        };

        Arc::new(State::new(config, storage, Popularity::new()).unwrap())
    }

    /// A resolver stub that always produces the given result file.
    fn stub_resolver(tmp: &TempDir, result_json: &str) -> String {
        let result_file = tmp.path().join("result.json");
        std::fs::write(&result_file, result_json).unwrap();

        let script = tmp.path().join("resolver");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho {}\n", result_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        script.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_build_image_propagates_not_found() {
        let tmp = TempDir::new().unwrap();
        let resolver = stub_resolver(&tmp, r#"{"error":"not_found","pkgs":["nope"]}"#);
        let state = state_with_resolver(&tmp, &resolver);

        let image = crate::image::Image::from_name("nope", "latest");
        let err = build_image(&state, &image).await.unwrap_err();

        match err {
            NixeryError::PackagesNotFound { pkgs } => assert_eq!(pkgs, vec!["nope"]),
            other => panic!("expected PackagesNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_image_rejects_unknown_resolver_error() {
        let tmp = TempDir::new().unwrap();
        let resolver = stub_resolver(&tmp, r#"{"error":"evaluation_exploded","pkgs":[]}"#);
        let state = state_with_resolver(&tmp, &resolver);

        let image = crate::image::Image::from_name("hello", "latest");
        let err = build_image(&state, &image).await.unwrap_err();
        assert!(matches!(err, NixeryError::Resolver { .. }));
    }

    #[tokio::test]
    async fn test_build_image_requires_graph_and_symlink_layer() {
        let tmp = TempDir::new().unwrap();
        // Success-shaped output with both success fields missing
        let resolver = stub_resolver(&tmp, "{}");
        let state = state_with_resolver(&tmp, &resolver);

        let image = crate::image::Image::from_name("hello", "latest");
        let err = build_image(&state, &image).await.unwrap_err();
        assert!(matches!(err, NixeryError::Resolver { .. }));
    }

    #[tokio::test]
    async fn test_upload_hash_layer_content_addressed() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp);

        let entry = upload_hash_layer(&state, "test-key", "application/octet-stream", |w| {
            w.write_all(b"hello").map_err(NixeryError::from)
        })
        .await
        .unwrap();

        // Known SHA256 of "hello"
        assert_eq!(
            entry.digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(entry.size, 5);

        // Staging is empty, the blob lives at its final address
        assert!(state.storage.fetch("staging/test-key").await.is_err());
        let stored = state
            .storage
            .fetch("layers/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
            .await
            .unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn test_upload_hash_layer_failure_leaves_no_final_blob() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp);

        let result = upload_hash_layer(&state, "fail-key", "application/octet-stream", |w| {
            w.write_all(b"partial").map_err(NixeryError::from)?;
            Err(NixeryError::Packing("boom".to_string()))
        })
        .await;

        assert!(result.is_err());

        // No object may exist under layers/ for this write
        let layers_dir = tmp.path().join("storage/layers");
        let count = std::fs::read_dir(&layers_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_keyed_locks_are_exclusive_per_key() {
        let locks = Arc::new(KeyedLocks::default());
        let counter = Arc::new(std::sync::Mutex::new((0u32, 0u32))); // (active, max)

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same-key").await;
                {
                    let mut c = counter.lock().unwrap();
                    c.0 += 1;
                    c.1 = c.1.max(c.0);
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                counter.lock().unwrap().0 -= 1;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.lock().unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_keyed_locks_distinct_keys_do_not_block() {
        let locks = KeyedLocks::default();

        let _a = locks.acquire("a").await;
        // Must not deadlock
        let _b = locks.acquire("b").await;
    }

    #[tokio::test]
    async fn test_hashing_sink_counts_and_hashes() {
        let mut buffer = Vec::new();
        let mut sink = HashingSink::new(&mut buffer);
        sink.write_all(b"hel").unwrap();
        sink.write_all(b"lo").unwrap();
        let (sha, count) = sink.finish();

        assert_eq!(count, 5);
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(buffer, b"hello");
    }
}
