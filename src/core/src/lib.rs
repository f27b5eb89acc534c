//! Nixery Core - Foundational Types and Abstractions
//!
//! This crate provides the configuration, error and logging primitives
//! shared across the Nixery registry crates.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{Config, PkgSource, StorageKind};
pub use error::{NixeryError, Result};

/// Nixery version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
