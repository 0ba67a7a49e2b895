// Fetch coordinator
//
// Drives one refresh cycle against a storage service: pages through the
// package index, stages every page, reconciles deletions and feeds AIPs to a
// bounded pool of METS workers through a channel. The channel capacity is the
// backpressure on enumeration.
//
// A paged subset fetch instead reads the whole index in one request, caches it
// as `packages.json` in a (possibly reused) session directory and imports one
// window of it.

use super::client::{FetchedPage, StorageServiceClient};
use super::package::{PackageDescriptor, PackagePage, PackageRecord, PackageTally};
use super::staging::StagingArea;
use super::worker::{IngestOutcome, IngestTask, MetsWorker};
use crate::config::AggregatorConfig;
use crate::db::{FetchJob, FetchJobTotals, StorageService, Store};
use crate::error::{AggregatorError, Result};
use chrono::{Local, SubsecRound};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-outcome counts from the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<IngestOutcome>) {
        match result {
            Ok(IngestOutcome::Ingested { .. }) => self.ingested += 1,
            Ok(IngestOutcome::Duplicate { .. }) => self.duplicates += 1,
            Ok(IngestOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Result of a completed fetch cycle.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub fetch_job: FetchJob,
    pub totals: FetchJobTotals,
    pub workers: WorkerStats,
}

impl FetchReport {
    pub fn summary(&self) -> String {
        self.totals.summary()
    }
}

/// Limit used to request the whole package index in one response.
pub const FULL_INDEX_LIMIT: i64 = 1_000_000;

/// One window over the full package index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSelection {
    /// 1-based page number.
    pub page: u64,
    pub packages_per_page: u64,
    /// Session directory whose cached index is reused.
    pub session_id: Option<String>,
}

impl PageSelection {
    pub fn new(page: u64, packages_per_page: u64) -> Self {
        Self {
            page,
            packages_per_page,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 1-based inclusive range of index positions covered by the page.
    pub fn item_range(&self) -> (u64, u64) {
        let start = self
            .page
            .saturating_sub(1)
            .saturating_mul(self.packages_per_page)
            .saturating_add(1);
        let end = start.saturating_add(self.packages_per_page.saturating_sub(1));
        (start, end)
    }

    fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(AggregatorError::config("page must be a positive number"));
        }
        if self.packages_per_page == 0 {
            return Err(AggregatorError::config("packages per page must be a positive number"));
        }
        Ok(())
    }
}

struct Enumeration {
    total_count: u64,
    tally: PackageTally,
}

pub struct FetchCoordinator {
    store: Store,
    client: StorageServiceClient,
    config: AggregatorConfig,
    cancel: CancellationToken,
}

impl FetchCoordinator {
    pub fn new(store: Store, config: AggregatorConfig) -> Result<Self> {
        let client = StorageServiceClient::from_config(&config)?;
        Ok(Self::with_client(store, client, config))
    }

    pub fn with_client(store: Store, client: StorageServiceClient, config: AggregatorConfig) -> Self {
        Self {
            store,
            client,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops enumeration before the next page is requested.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one fetch cycle for `storage_service_id`.
    ///
    /// Enumeration errors and cancellation leave the fetch job without an end
    /// timestamp. Failures of single AIPs are counted, not propagated.
    pub async fn run(&self, storage_service_id: i64) -> Result<FetchReport> {
        self.execute(storage_service_id, None).await
    }

    /// Import only the packages of `selection` from the full index.
    ///
    /// A page that starts past the end of the index deletes the fetch job and
    /// fails with [`AggregatorError::PageOutOfRange`].
    pub async fn run_page(&self, storage_service_id: i64, selection: &PageSelection) -> Result<FetchReport> {
        selection.validate()?;
        self.execute(storage_service_id, Some(selection)).await
    }

    async fn execute(&self, storage_service_id: i64, selection: Option<&PageSelection>) -> Result<FetchReport> {
        let started = Instant::now();
        let service = self
            .store
            .get_storage_service(storage_service_id)
            .await?
            .ok_or_else(|| AggregatorError::not_found("Storage service", storage_service_id))?;

        info!(
            storage_service = %service.name,
            storage_service_id = service.id,
            "Step 1/4: Creating fetch job"
        );
        let (staging, download_start) = match selection.and_then(|s| s.session_id.as_deref()) {
            Some(session_id) => (
                StagingArea::open(&self.config.download_root, session_id).await?,
                Local::now().naive_local().trunc_subsecs(0),
            ),
            None => {
                let staging = StagingArea::claim(&self.config.download_root).await?;
                let started_at = staging.started_at();
                (staging, started_at)
            },
        };
        let staging = Arc::new(staging);
        let fetch_job = self
            .store
            .create_fetch_job(service.id, download_start, &staging.download_directory())
            .await?;
        info!(
            fetch_job_id = fetch_job.id,
            download_directory = %fetch_job.download_directory,
            "Fetch job created"
        );

        let service = Arc::new(service);
        let worker = MetsWorker::new(
            self.store.clone(),
            self.client.clone(),
            Arc::clone(&service),
            Arc::clone(&staging),
        );
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let pool = spawn_worker_pool(worker, rx, self.config.worker_concurrency);

        info!(fetch_job_id = fetch_job.id, "Step 2/4: Enumerating packages");
        let enumeration = match selection {
            Some(selection) => {
                self.enumerate_selection(&service, &fetch_job, &staging, selection, &tx)
                    .await
            },
            None => self.enumerate(&service, &fetch_job, &staging, &tx).await,
        };

        // Closing the channel lets the pool drain and finish.
        drop(tx);
        info!(fetch_job_id = fetch_job.id, "Step 3/4: Waiting for METS workers");
        let workers = pool
            .await
            .map_err(|e| AggregatorError::Io(std::io::Error::other(e)))?;

        let enumeration = match enumeration {
            Ok(enumeration) => enumeration,
            Err(e) => {
                error!(
                    fetch_job_id = fetch_job.id,
                    error = %e,
                    ingested = workers.ingested,
                    failed = workers.failed,
                    "Fetch job aborted"
                );
                return Err(e);
            },
        };

        info!(fetch_job_id = fetch_job.id, "Step 4/4: Finalizing fetch job");
        let totals = enumeration.tally.totals(enumeration.total_count);
        let download_end = Local::now().naive_local().trunc_subsecs(0);
        let fetch_job = self
            .store
            .finalize_fetch_job(fetch_job.id, &totals, download_end)
            .await?;

        if enumeration.tally.unclassified > 0 {
            warn!(
                fetch_job_id = fetch_job.id,
                unclassified = enumeration.tally.unclassified,
                "Some packages have an unknown type and were ignored"
            );
        }

        info!(
            fetch_job_id = fetch_job.id,
            total_packages = totals.total_packages,
            ingested = workers.ingested,
            duplicates = workers.duplicates,
            skipped = workers.skipped,
            failed = workers.failed,
            duration_secs = started.elapsed().as_secs_f64(),
            "Fetch complete: {}",
            totals.summary()
        );

        Ok(FetchReport {
            fetch_job,
            totals,
            workers,
        })
    }

    async fn enumerate(
        &self,
        service: &StorageService,
        fetch_job: &FetchJob,
        staging: &StagingArea,
        tx: &mpsc::Sender<IngestTask>,
    ) -> Result<Enumeration> {
        let first = self
            .client
            .request_package_page(service, service.download_offset, service.download_limit)
            .await?;

        let total_count = first.page.meta.total_count;
        let limit = u64::try_from(service.download_limit.max(1)).unwrap_or(1);
        let total_package_lists = total_count.div_ceil(limit);
        info!(
            fetch_job_id = fetch_job.id,
            total_count,
            total_package_lists,
            "Package index reports {} packages",
            total_count
        );

        let mut tally = PackageTally::default();
        let mut page_number = 1usize;
        let mut fetched = first;

        loop {
            let page = self.stage_page(staging, page_number, fetched).await;
            let next = page.meta.next.clone();

            self.process_records(fetch_job, page_number, &page.objects, tx, &mut tally)
                .await?;

            if self.config.remove_package_lists {
                staging.remove_package_list(page_number).await;
            }

            let Some(next) = next else {
                break;
            };
            if self.cancel.is_cancelled() {
                warn!(
                    fetch_job_id = fetch_job.id,
                    pages_done = page_number,
                    "Fetch cancelled, remaining pages skipped"
                );
                return Err(AggregatorError::Cancelled(fetch_job.id));
            }

            page_number += 1;
            debug!(fetch_job_id = fetch_job.id, page_number, total_package_lists, "Requesting next page");
            fetched = self.client.request_next_page(service, &next).await?;
        }

        Ok(Enumeration { total_count, tally })
    }

    async fn enumerate_selection(
        &self,
        service: &StorageService,
        fetch_job: &FetchJob,
        staging: &StagingArea,
        selection: &PageSelection,
        tx: &mpsc::Sender<IngestTask>,
    ) -> Result<Enumeration> {
        let index = self.package_index(service, staging).await?;
        let total = index.objects.len() as u64;
        let (start_item, end_item) = selection.item_range();

        if start_item > total {
            self.store.delete_fetch_job(fetch_job.id).await?;
            error!(
                fetch_job_id = fetch_job.id,
                page = selection.page,
                start_item,
                total,
                "Fetch job deleted, page is past the end of the package index"
            );
            return Err(AggregatorError::PageOutOfRange {
                page: selection.page,
                start_item,
                total,
            });
        }

        info!(
            fetch_job_id = fetch_job.id,
            "Processing packages {} to {} of {}",
            start_item,
            end_item.min(total),
            total
        );

        let skip = usize::try_from(start_item - 1).unwrap_or(usize::MAX);
        let take = usize::try_from(selection.packages_per_page).unwrap_or(usize::MAX);
        let end = skip.saturating_add(take).min(index.objects.len());
        let batch = usize::try_from(selection.page).unwrap_or(usize::MAX);

        let mut tally = PackageTally::default();
        self.process_records(fetch_job, batch, &index.objects[skip..end], tx, &mut tally)
            .await?;

        Ok(Enumeration {
            total_count: total,
            tally,
        })
    }

    /// The session's cached `packages.json`, or the full index from the remote.
    async fn package_index(&self, service: &StorageService, staging: &StagingArea) -> Result<PackagePage> {
        if let Some(index) = staging.read_package_index().await? {
            info!(
                path = %staging.package_index_path().display(),
                packages = index.objects.len(),
                "Using cached package index"
            );
            return Ok(index);
        }

        let fetched = self
            .client
            .request_package_page(service, 0, FULL_INDEX_LIMIT)
            .await?;
        if let Err(e) = staging.write_package_index(&fetched.raw).await {
            warn!(error = %e, "Could not cache package index");
        }
        Ok(fetched.page)
    }

    /// Write the page to `packages{n}.json`. A failed write is only a warning;
    /// the page in memory is used either way.
    async fn stage_page(&self, staging: &StagingArea, page_number: usize, fetched: FetchedPage) -> PackagePage {
        if let Err(e) = staging.write_package_list(page_number, &fetched.raw).await {
            warn!(page_number, error = %e, "Could not stage package list");
        }
        fetched.page
    }

    /// Classify every record, apply deletions, then queue the batch's AIPs.
    async fn process_records(
        &self,
        fetch_job: &FetchJob,
        batch: usize,
        records: &[PackageRecord],
        tx: &mpsc::Sender<IngestTask>,
        tally: &mut PackageTally,
    ) -> Result<()> {
        let mut tasks = Vec::new();

        for record in records {
            let descriptor = PackageDescriptor::classify(record);
            tally.record(&descriptor);

            if descriptor.is_deleted() {
                self.reconcile_deletion(&descriptor).await?;
            } else if descriptor.is_undeleted_aip() {
                match IngestTask::from_descriptor(&descriptor, fetch_job.id, batch) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!(
                        uuid = descriptor.uuid.as_deref().unwrap_or_default(),
                        error = %e,
                        "AIP record cannot be ingested"
                    ),
                }
            }
        }

        debug!(fetch_job_id = fetch_job.id, batch, queued = tasks.len(), "Queueing AIPs");
        for task in tasks {
            tx.send(task)
                .await
                .map_err(|_| AggregatorError::Io(std::io::Error::other("METS worker pool stopped")))?;
        }
        Ok(())
    }

    async fn reconcile_deletion(&self, descriptor: &PackageDescriptor) -> Result<()> {
        let Some(uuid) = descriptor.uuid.as_deref() else {
            return Ok(());
        };
        let removed = self.store.delete_aips_by_uuid(uuid).await?;
        if removed > 0 {
            info!(%uuid, removed, "Removed AIP deleted from the storage service");
        }
        Ok(())
    }
}

fn spawn_worker_pool(
    worker: MetsWorker,
    rx: mpsc::Receiver<IngestTask>,
    concurrency: usize,
) -> JoinHandle<WorkerStats> {
    tokio::spawn(async move {
        ReceiverStream::new(rx)
            .map(|task| {
                let worker = worker.clone();
                async move { worker.ingest(task).await }
            })
            .buffer_unordered(concurrency.max(1))
            .fold(WorkerStats::default(), |mut stats, result| async move {
                stats.record(&result);
                stats
            })
            .await
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_selection_range() {
        assert_eq!(PageSelection::new(1, 20).item_range(), (1, 20));
        assert_eq!(PageSelection::new(3, 2).item_range(), (5, 6));
        assert_eq!(PageSelection::new(2, 1).item_range(), (2, 2));
        assert!(PageSelection::new(0, 5).validate().is_err());
        assert!(PageSelection::new(1, 0).validate().is_err());
        assert!(PageSelection::new(1, 1).with_session("2024-01-18-10-00-00").validate().is_ok());
    }

    #[test]
    fn test_worker_stats() {
        let mut stats = WorkerStats::default();
        stats.record(&Ok(IngestOutcome::Ingested { aip_id: 1 }));
        stats.record(&Ok(IngestOutcome::Duplicate { aip_id: 1 }));
        stats.record(&Ok(IngestOutcome::Skipped {
            reason: "bad xml".into(),
        }));
        stats.record(&Err(AggregatorError::mets("x")));
        stats.record(&Err(AggregatorError::transport("http://ss", "HTTP 404")));
        assert_eq!(
            stats,
            WorkerStats {
                ingested: 1,
                duplicates: 1,
                skipped: 1,
                failed: 2,
            }
        );
    }
}
