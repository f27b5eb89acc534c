//! Filesystem storage backend.
//!
//! Stores all blobs under a single root directory. Intended for
//! single-node deployments where the registry and its storage share a
//! disk; blobs are served by streaming the files directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use nixery_core::error::{NixeryError, Result};

use super::{Persister, ServeOutcome, StorageBackend};

pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create a backend rooted at the given directory, creating it if
    /// necessary.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            NixeryError::Storage(format!(
                "failed to create storage root {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(FsBackend { root })
    }

    /// Construct the backend from the `STORAGE_PATH` environment
    /// variable.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("STORAGE_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                NixeryError::Config("STORAGE_PATH must be set for filesystem storage".to_string())
            })?;

        FsBackend::new(path)
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            NixeryError::Storage(format!(
                "failed to create storage directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> String {
        format!("filesystem ({})", self.root.display())
    }

    async fn persist(
        &self,
        path: &str,
        _content_type: &str,
        writer: Persister,
    ) -> Result<(String, u64)> {
        let full = self.full_path(path);

        tokio::task::spawn_blocking(move || {
            ensure_parent(&full)?;

            let mut file = std::fs::File::create(&full).map_err(|e| {
                NixeryError::Storage(format!("failed to create {}: {}", full.display(), e))
            })?;

            writer(&mut file)
        })
        .await
        .map_err(|e| NixeryError::Storage(format!("persist task failed: {}", e)))?
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path);

        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NixeryError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(NixeryError::Storage(format!(
                "failed to read {}: {}",
                full.display(),
                e
            ))),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let old = self.full_path(from);
        let new = self.full_path(to);

        ensure_parent(&new)?;

        match tokio::fs::rename(&old, &new).await {
            Ok(()) => Ok(()),
            // A lost race with another rename of the same pair leaves
            // the target in place, which is all the caller needs.
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    && tokio::fs::try_exists(&new).await.unwrap_or(false) =>
            {
                Ok(())
            }
            Err(e) => Err(NixeryError::Storage(format!(
                "failed to rename {} to {}: {}",
                old.display(),
                new.display(),
                e
            ))),
        }
    }

    async fn serve(&self, digest: &str) -> Result<ServeOutcome> {
        let path = self.root.join("layers").join(digest);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                tracing::debug!(layer = %digest, path = %path.display(), "serving layer from filesystem");
                Ok(ServeOutcome::File(path))
            }
            _ => Err(NixeryError::NotFound {
                path: format!("layers/{}", digest),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Write;
    use tempfile::TempDir;

    fn bytes_persister(data: &'static [u8]) -> Persister {
        Box::new(move |w: &mut dyn Write| {
            w.write_all(data)?;
            let mut hasher = Sha256::new();
            hasher.update(data);
            Ok((hex::encode(hasher.finalize()), data.len() as u64))
        })
    }

    #[tokio::test]
    async fn test_persist_and_fetch_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path().join("store")).unwrap();

        let (sha, size) = backend
            .persist("staging/test", "application/octet-stream", bytes_persister(b"hello"))
            .await
            .unwrap();

        assert_eq!(size, 5);
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let fetched = backend.fetch("staging/test").await.unwrap();
        assert_eq!(fetched, b"hello");
    }

    #[tokio::test]
    async fn test_fetch_absent_is_clean_miss() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        let err = backend.fetch("manifests/nope").await.unwrap_err();
        assert!(matches!(err, NixeryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rename_moves_blob() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        backend
            .persist("staging/abc", "", bytes_persister(b"layer data"))
            .await
            .unwrap();
        backend.rename("staging/abc", "layers/abc").await.unwrap();

        assert!(backend.fetch("staging/abc").await.is_err());
        assert_eq!(backend.fetch("layers/abc").await.unwrap(), b"layer data");
    }

    #[tokio::test]
    async fn test_rename_is_safe_to_rerun() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        backend
            .persist("staging/abc", "", bytes_persister(b"data"))
            .await
            .unwrap();
        backend.rename("staging/abc", "layers/abc").await.unwrap();
        // Second run of the same pair must not fail
        backend.rename("staging/abc", "layers/abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_existing_layer() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        backend
            .persist("layers/deadbeef", "", bytes_persister(b"blob"))
            .await
            .unwrap();

        match backend.serve("deadbeef").await.unwrap() {
            ServeOutcome::File(path) => {
                assert_eq!(std::fs::read(path).unwrap(), b"blob");
            }
            other => panic!("expected file outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serve_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        let err = backend.serve("cafebabe").await.unwrap_err();
        assert!(matches!(err, NixeryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_persist_error_propagates() {
        let tmp = TempDir::new().unwrap();
        let backend = FsBackend::new(tmp.path()).unwrap();

        let failing: Persister = Box::new(|_w| {
            Err(NixeryError::Packing("walk failed".to_string()))
        });

        let err = backend.persist("staging/x", "", failing).await.unwrap_err();
        assert!(matches!(err, NixeryError::Packing(_)));
    }
}
