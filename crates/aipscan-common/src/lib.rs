//! AIPscan Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the AIPscan workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: incremental SHA-256 used while streaming METS downloads
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
