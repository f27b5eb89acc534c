//! Pluggable blob storage for layers, manifests and cache entries.
//!
//! Two backends exist: a local filesystem tree and an S3-compatible
//! object store. The build pipeline takes no position on which is in
//! use; everything goes through the [`StorageBackend`] trait.
//!
//! # Layout
//!
//! ```text
//! layers/<sha256>        compressed layer tarballs and config blobs
//! manifests/<key>        cached manifests, keyed by build fingerprint
//! builds/<layer-key>     cached layer descriptors
//! staging/<key>          in-progress uploads, renamed once hashed
//! ```

mod filesystem;
mod s3;

pub use filesystem::FsBackend;
pub use s3::S3Backend;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use nixery_core::config::{Config, StorageKind};
use nixery_core::error::Result;

/// Callback that writes blob data into a storage sink.
///
/// The callback returns the SHA256 and byte count of whatever it wrote;
/// how those are computed is the caller's business (the layer packer
/// hashes the compressed stream as it produces it).
pub type Persister = Box<dyn FnOnce(&mut dyn Write) -> Result<(String, u64)> + Send>;

/// How a blob should be delivered to a registry client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Stream the file at this local path directly.
    File(PathBuf),

    /// Redirect the client to this URL (303).
    Redirect(String),
}

/// A storage backend for the registry.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name, for use in log messages and such.
    fn name(&self) -> String;

    /// Store data under `path` via the supplied writer callback.
    ///
    /// The data is visible at `path` once this returns successfully.
    /// Returns the SHA256 and size reported by the callback.
    async fn persist(
        &self,
        path: &str,
        content_type: &str,
        writer: Persister,
    ) -> Result<(String, u64)>;

    /// Retrieve data stored under `path`.
    ///
    /// A path that was never persisted fails with
    /// [`nixery_core::NixeryError::NotFound`], so cache probes can treat
    /// absence as a clean miss.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;

    /// Rename a stored object. Used to move uploads out of the staging
    /// prefix once their content hash is known.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Resolve how the blob with the given digest should be served.
    async fn serve(&self, digest: &str) -> Result<ServeOutcome>;
}

/// Construct the backend selected by the configuration, reading
/// backend-specific settings from the environment.
pub fn from_config(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageKind::Filesystem => Ok(Arc::new(FsBackend::from_env()?)),
        StorageKind::S3 => Ok(Arc::new(S3Backend::from_env()?)),
    }
}
