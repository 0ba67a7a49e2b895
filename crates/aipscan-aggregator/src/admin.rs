//! Operator tasks around the fetch cycle: registering storage services and
//! cleaning up fetch jobs.

use crate::db::{FetchJob, NewStorageService, StorageService, Store};
use crate::error::{AggregatorError, Result};
use crate::ingest::staging::remove_download_directory;
use std::path::Path;
use tracing::{info, warn};

/// Selector accepted wherever a storage service is named on the command line.
pub const DEFAULT_SELECTOR: &str = "default";

/// Create the storage service or update the one with the same name.
pub async fn bootstrap_storage_service(
    store: &Store,
    new: &NewStorageService,
) -> Result<StorageService> {
    if new.url.trim().is_empty() {
        return Err(AggregatorError::config("storage service URL cannot be empty"));
    }

    let (service, created) = store.upsert_storage_service(new).await?;
    info!(
        storage_service_id = service.id,
        name = %service.name,
        url = %service.url,
        is_default = service.is_default,
        "{} storage service",
        if created { "Created" } else { "Updated" }
    );
    Ok(service)
}

/// Resolve `"default"` or a numeric id to a storage service.
pub async fn resolve_storage_service(store: &Store, selector: &str) -> Result<StorageService> {
    if selector.eq_ignore_ascii_case(DEFAULT_SELECTOR) {
        return store
            .default_storage_service()
            .await?
            .ok_or_else(|| AggregatorError::not_found("Storage service", DEFAULT_SELECTOR));
    }

    let id: i64 = selector.parse().map_err(|_| {
        AggregatorError::config(format!(
            "storage service must be an id or '{}', got '{}'",
            DEFAULT_SELECTOR, selector
        ))
    })?;

    store
        .get_storage_service(id)
        .await?
        .ok_or_else(|| AggregatorError::not_found("Storage service", id))
}

/// Delete a fetch job, its AIPs and its staging directory.
///
/// The staging directory is removed after the row; failing to remove it is
/// only a warning.
pub async fn delete_fetch_job(store: &Store, download_root: &Path, id: i64) -> Result<FetchJob> {
    let job = store
        .delete_fetch_job(id)
        .await?
        .ok_or_else(|| AggregatorError::not_found("Fetch job", id))?;

    match remove_download_directory(download_root, &job.download_directory).await {
        Ok(true) => info!(fetch_job_id = id, directory = %job.download_directory, "Removed staging directory"),
        Ok(false) => {},
        Err(e) => warn!(
            fetch_job_id = id,
            directory = %job.download_directory,
            error = %e,
            "Could not remove staging directory"
        ),
    }

    Ok(job)
}
