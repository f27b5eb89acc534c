use thiserror::Error;

/// Nixery error types
#[derive(Error, Debug)]
pub enum NixeryError {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The package set resolver failed to run or produced unusable output
    #[error("Resolver error: {message}")]
    Resolver { message: String },

    /// The resolver reported that requested packages do not exist.
    ///
    /// This is a structured result from the resolver, not a process
    /// failure, and maps to a 404 at the registry surface.
    #[error("Could not find Nix packages: {pkgs:?}")]
    PackagesNotFound { pkgs: Vec<String> },

    /// The resolver exceeded its configured timeout
    #[error("Resolver timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Storage backend failure during persist, fetch, rename or serve
    #[error("Storage error: {0}")]
    Storage(String),

    /// A requested object does not exist in the storage backend.
    ///
    /// Kept separate from [`NixeryError::Storage`] so that cache probes
    /// can treat absence as a clean miss instead of an I/O failure.
    #[error("Object not found in storage: {path}")]
    NotFound { path: String },

    /// Failure while walking store paths or writing a layer tarball
    #[error("Packing error: {0}")]
    Packing(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NixeryError {
    fn from(err: serde_json::Error) -> Self {
        NixeryError::Serialization(err.to_string())
    }
}

/// Result type alias for Nixery operations
pub type Result<T> = std::result::Result<T, NixeryError>;
