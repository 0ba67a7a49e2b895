//! Storage service ingestion: enumeration, classification and METS workers.

pub mod client;
pub mod coordinator;
pub mod endpoints;
pub mod mets;
pub mod package;
pub mod staging;
pub mod worker;

pub use client::{FetchedPage, StorageServiceClient};
pub use coordinator::{FetchCoordinator, FetchReport, PageSelection, WorkerStats};
pub use endpoints::sanitize_url;
pub use package::{PackageDescriptor, PackageKind, PackagePage, PackageRecord, PackageTally};
pub use staging::StagingArea;
pub use worker::{IngestOutcome, IngestState, IngestTask, MetsWorker};
