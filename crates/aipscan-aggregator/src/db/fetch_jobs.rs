use super::{Aip, FetchJob, FetchJobTotals, Store};
use crate::error::{AggregatorError, Result};
use chrono::NaiveDateTime;

const FETCH_JOB_COLUMNS: &str = "id, total_packages, total_aips, total_dips, total_sips, \
     total_replicas, total_deleted_aips, download_start, download_end, download_directory, \
     storage_service_id";

impl Store {
    /// Insert a running fetch job; all totals and the end timestamp stay null.
    pub async fn create_fetch_job(
        &self,
        storage_service_id: i64,
        download_start: NaiveDateTime,
        download_directory: &str,
    ) -> Result<FetchJob> {
        let job = sqlx::query_as::<_, FetchJob>(&format!(
            "INSERT INTO fetch_jobs (download_start, download_directory, storage_service_id) \
             VALUES (?, ?, ?) RETURNING {}",
            FETCH_JOB_COLUMNS
        ))
        .bind(download_start)
        .bind(download_directory)
        .bind(storage_service_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(job)
    }

    /// Record totals and the end timestamp. Fails if the job was already
    /// finalized.
    pub async fn finalize_fetch_job(
        &self,
        id: i64,
        totals: &FetchJobTotals,
        download_end: NaiveDateTime,
    ) -> Result<FetchJob> {
        let job = sqlx::query_as::<_, FetchJob>(&format!(
            r#"
            UPDATE fetch_jobs SET
                total_packages = ?,
                total_aips = ?,
                total_dips = ?,
                total_sips = ?,
                total_replicas = ?,
                total_deleted_aips = ?,
                download_end = ?
            WHERE id = ? AND download_end IS NULL
            RETURNING {}
            "#,
            FETCH_JOB_COLUMNS
        ))
        .bind(totals.total_packages)
        .bind(totals.total_aips)
        .bind(totals.total_dips)
        .bind(totals.total_sips)
        .bind(totals.total_replicas)
        .bind(totals.total_deleted_aips)
        .bind(download_end)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| AggregatorError::not_found("running fetch job", id))
    }

    pub async fn get_fetch_job(&self, id: i64) -> Result<Option<FetchJob>> {
        let job = sqlx::query_as::<_, FetchJob>(&format!(
            "SELECT {} FROM fetch_jobs WHERE id = ?",
            FETCH_JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn list_fetch_jobs(&self, storage_service_id: Option<i64>) -> Result<Vec<FetchJob>> {
        let jobs = sqlx::query_as::<_, FetchJob>(&format!(
            "SELECT {} FROM fetch_jobs WHERE (?1 IS NULL OR storage_service_id = ?1) \
             ORDER BY download_start DESC, id DESC",
            FETCH_JOB_COLUMNS
        ))
        .bind(storage_service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// AIP rows currently attributed to a fetch job.
    pub async fn aips_for_fetch_job(&self, fetch_job_id: i64) -> Result<Vec<Aip>> {
        let aips = sqlx::query_as::<_, Aip>("SELECT * FROM aips WHERE fetch_job_id = ? ORDER BY id")
            .bind(fetch_job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(aips)
    }

    /// Delete a fetch job and, through the cascade, the AIPs it created.
    ///
    /// Returns the deleted row so the caller can remove its staging directory.
    pub async fn delete_fetch_job(&self, id: i64) -> Result<Option<FetchJob>> {
        let job = sqlx::query_as::<_, FetchJob>(&format!(
            "DELETE FROM fetch_jobs WHERE id = ? RETURNING {}",
            FETCH_JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}
