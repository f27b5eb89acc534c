//! Nixery Server - Registry HTTP surface.
//!
//! Exposes the pull-only subset of the Docker Registry HTTP API V2 on
//! top of the build pipeline in `nixery-registry`, plus a small index
//! page showing the running version and recent build failures.

pub mod error;
pub mod server;

pub use server::router;
