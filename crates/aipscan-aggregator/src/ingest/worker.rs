//! METS ingestion for a single AIP.
//!
//! One [`IngestTask`] goes through:
//!
//! ```text
//! New -> Hashed -> Duplicate -> Done
//!              \-> Parsed -> Replacing -> Written -> Done
//! ```
//!
//! Any transport, parse or storage failure ends in `Failed`; the AIP
//! transaction is rolled back by dropping it.

use super::client::StorageServiceClient;
use super::mets::{parse_mets, ParsedMets};
use super::package::PackageDescriptor;
use super::staging::StagingArea;
use crate::db::{NewAip, StorageService, Store};
use crate::error::{AggregatorError, ErrorKind, Result};
use aipscan_common::checksum::Sha256Digest;
use futures::StreamExt;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestTask {
    pub uuid: String,
    pub size: Option<i64>,
    pub relative_path: String,
    pub fetch_job_id: i64,
    /// Number of the package page the AIP was listed on.
    pub batch: usize,
    pub current_location: Option<String>,
    pub origin_pipeline: Option<String>,
}

impl IngestTask {
    pub fn from_descriptor(
        descriptor: &PackageDescriptor,
        fetch_job_id: i64,
        batch: usize,
    ) -> Result<Self> {
        let relative_path = descriptor.relative_mets_path()?;
        let uuid = descriptor
            .uuid
            .clone()
            .ok_or_else(|| AggregatorError::package("AIP record has no uuid"))?;

        Ok(Self {
            uuid,
            size: descriptor.size,
            relative_path,
            fetch_job_id,
            batch,
            current_location: descriptor.current_location.clone(),
            origin_pipeline: descriptor.origin_pipeline.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    New,
    Hashed,
    Duplicate,
    Parsed,
    Replacing,
    Written,
    Done,
    Failed,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestState::New => "new",
            IngestState::Hashed => "hashed",
            IngestState::Duplicate => "duplicate",
            IngestState::Parsed => "parsed",
            IngestState::Replacing => "replacing",
            IngestState::Written => "written",
            IngestState::Done => "done",
            IngestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new AIP row was written, replacing any earlier row with the same uuid.
    Ingested { aip_id: i64 },
    /// An AIP with identical METS bytes is already stored.
    Duplicate { aip_id: i64 },
    /// The METS could not be parsed; existing rows are untouched.
    Skipped { reason: String },
}

/// Tracks the state of one ingestion for logging.
struct Progress<'a> {
    uuid: &'a str,
    state: IngestState,
}

impl Progress<'_> {
    fn advance(&mut self, next: IngestState) {
        debug!(uuid = %self.uuid, from = %self.state, to = %next, "Ingestion state");
        self.state = next;
    }
}

#[derive(Clone)]
pub struct MetsWorker {
    store: Store,
    client: StorageServiceClient,
    service: Arc<StorageService>,
    staging: Arc<StagingArea>,
}

impl MetsWorker {
    pub fn new(
        store: Store,
        client: StorageServiceClient,
        service: Arc<StorageService>,
        staging: Arc<StagingArea>,
    ) -> Self {
        Self {
            store,
            client,
            service,
            staging,
        }
    }

    /// Ingest one AIP. Errors are logged here; the caller only counts them.
    pub async fn ingest(&self, task: IngestTask) -> Result<IngestOutcome> {
        let mut progress = Progress {
            uuid: &task.uuid,
            state: IngestState::New,
        };

        match self.run(&task, &mut progress).await {
            Ok(outcome) => {
                progress.advance(IngestState::Done);
                Ok(outcome)
            },
            Err(e) => {
                let failed_in = progress.state;
                progress.advance(IngestState::Failed);
                error!(
                    uuid = %task.uuid,
                    fetch_job_id = task.fetch_job_id,
                    state = %failed_in,
                    error = %e,
                    "METS ingestion failed"
                );
                Err(e)
            },
        }
    }

    async fn run(&self, task: &IngestTask, progress: &mut Progress<'_>) -> Result<IngestOutcome> {
        let storage_location_id = self.storage_location_id(task).await?;
        let origin_pipeline_id = self.origin_pipeline_id(task).await?;

        let mets_path = self.staging.mets_path(task.batch, &task.uuid);
        let mets_sha256 = self.download(task, &mets_path).await?;
        progress.advance(IngestState::Hashed);

        if let Some(existing) = self.store.find_aip_by_sha256(&mets_sha256).await? {
            progress.advance(IngestState::Duplicate);
            debug!(uuid = %task.uuid, aip_id = existing.id, "METS unchanged, skipping");
            remove_mets(&mets_path).await;
            return Ok(IngestOutcome::Duplicate { aip_id: existing.id });
        }

        let parsed = match parse_file(&mets_path).await {
            Ok(parsed) => parsed,
            Err(e) if e.kind() == ErrorKind::Mets => {
                warn!(
                    uuid = %task.uuid,
                    path = %mets_path.display(),
                    error = %e,
                    "METS could not be parsed, leaving existing records untouched"
                );
                return Ok(IngestOutcome::Skipped {
                    reason: e.to_string(),
                });
            },
            Err(e) => return Err(e),
        };
        progress.advance(IngestState::Parsed);

        let transfer_name = match parsed.transfer_name.clone() {
            Some(name) => name,
            None => {
                warn!(uuid = %task.uuid, "METS has no usable originalName, using the package uuid");
                task.uuid.clone()
            },
        };

        let new_aip = NewAip {
            uuid: task.uuid.clone(),
            transfer_name,
            create_date: parsed.create_date,
            mets_sha256,
            size: task.size,
            storage_service_id: self.service.id,
            storage_location_id,
            fetch_job_id: task.fetch_job_id,
            origin_pipeline_id,
        };

        progress.advance(IngestState::Replacing);
        let aip = self.store.replace_aip(&new_aip, &parsed).await?;
        progress.advance(IngestState::Written);

        info!(
            uuid = %aip.uuid,
            aip_id = aip.id,
            fetch_job_id = aip.fetch_job_id,
            originals = aip.originals_count.unwrap_or_default(),
            copies = aip.copies_count.unwrap_or_default(),
            "Ingested AIP"
        );

        remove_mets(&mets_path).await;
        Ok(IngestOutcome::Ingested { aip_id: aip.id })
    }

    async fn storage_location_id(&self, task: &IngestTask) -> Result<Option<i64>> {
        let Some(current_location) = task.current_location.as_deref() else {
            return Ok(None);
        };

        let description = self
            .client
            .location_description(&self.service, current_location)
            .await
            .unwrap_or_else(|e| {
                warn!(%current_location, error = %e, "Could not fetch storage location description");
                None
            });

        let location = self
            .store
            .upsert_storage_location(current_location, description.as_deref(), self.service.id)
            .await?;
        Ok(Some(location.id))
    }

    async fn origin_pipeline_id(&self, task: &IngestTask) -> Result<Option<i64>> {
        let Some(origin_pipeline) = task.origin_pipeline.as_deref() else {
            return Ok(None);
        };

        let remote_name = self
            .client
            .pipeline_remote_name(&self.service, origin_pipeline)
            .await
            .unwrap_or_else(|e| {
                warn!(%origin_pipeline, error = %e, "Could not fetch pipeline remote name");
                None
            });

        let pipeline = self.store.upsert_pipeline(origin_pipeline, remote_name.as_deref()).await?;
        Ok(Some(pipeline.id))
    }

    /// Stream the METS to `path`, hashing it on the way. Returns the hex digest.
    async fn download(&self, task: &IngestTask, path: &Path) -> Result<String> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = self.stream_to_file(task, path).await;
        if result.is_err() {
            remove_mets(path).await;
        }
        result
    }

    async fn stream_to_file(&self, task: &IngestTask, path: &Path) -> Result<String> {
        let stream = self
            .client
            .extract_file(&self.service, &task.uuid, &task.relative_path)
            .await?;
        let mut stream = std::pin::pin!(stream);

        let mut file = tokio::fs::File::create(path).await?;
        let mut digest = Sha256Digest::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(uuid = %task.uuid, bytes = digest.len(), "Downloaded METS");
        Ok(digest.finalize_hex())
    }
}

async fn parse_file(path: &Path) -> Result<ParsedMets> {
    let bytes = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || parse_mets(&bytes))
        .await
        .map_err(|e| AggregatorError::Io(std::io::Error::other(e)))?
}

async fn remove_mets(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove downloaded METS");
        }
    }
}
