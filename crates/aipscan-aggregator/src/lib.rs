//! AIPscan Aggregator Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pulls package listings and METS documents from Archivematica storage
//! services into a relational model of AIPs, files, PREMIS events and agents.
//!
//! - **Store**: SQLite persistence with declared cascades ([`db::Store`])
//! - **Client**: storage service API access with credential-free errors
//! - **Classifier**: AIP / DIP / SIP / replica / deleted package records
//! - **METS parser**: PREMIS objects, events and agents from one document
//! - **Coordinator**: one refresh cycle per storage service, with a bounded
//!   pool of METS workers
//!
//! # Example
//!
//! ```no_run
//! use aipscan_aggregator::config::AggregatorConfig;
//! use aipscan_aggregator::db::Store;
//! use aipscan_aggregator::ingest::FetchCoordinator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AggregatorConfig::load()?;
//!     let store = Store::open(&config.database).await?;
//!     let report = FetchCoordinator::new(store, config)?.run(1).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;

pub use error::{AggregatorError, ErrorKind, Result};
