//! On-disk staging area of one fetch job.
//!
//! ```text
//! {download_root}/{YYYY-MM-DD-HH-MM-SS}/
//!     packages/packages{n}.json
//!     packages/packages.json      full index of a paged subset fetch
//!     mets/{batch}/{uuid}.xml
//! ```

use super::package::PackagePage;
use crate::error::{AggregatorError, Result};
use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

const PACKAGES_DIR: &str = "packages";
const METS_DIR: &str = "mets";
const PACKAGE_INDEX_FILE: &str = "packages.json";
const PACKAGE_LIST_INDENT: &[u8] = b"    ";

#[derive(Debug, Clone)]
pub struct StagingArea {
    path: PathBuf,
    started_at: NaiveDateTime,
}

impl StagingArea {
    /// Create a fresh timestamped directory under `download_root`.
    ///
    /// Directory names have one-second resolution, so a second job started
    /// within the same second waits for the next one instead of sharing the
    /// directory.
    pub async fn claim(download_root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(download_root).await?;

        loop {
            let now = Local::now().naive_local().trunc_subsecs(0);
            let path = download_root.join(now.format(TIMESTAMP_FORMAT).to_string());

            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    tokio::fs::create_dir_all(path.join(PACKAGES_DIR)).await?;
                    tokio::fs::create_dir_all(path.join(METS_DIR)).await?;
                    debug!(path = %path.display(), "Claimed staging directory");
                    return Ok(Self {
                        path,
                        started_at: now,
                    });
                },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let wait = 1000 - u64::from(Local::now().timestamp_subsec_millis().min(999));
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reopen, or create, the directory of session `session_id`.
    ///
    /// The session id is the directory name, e.g. `2024-01-18-10-00-00`.
    pub async fn open(download_root: &Path, session_id: &str) -> Result<Self> {
        let started_at = NaiveDateTime::parse_from_str(session_id, TIMESTAMP_FORMAT).map_err(|_| {
            AggregatorError::config(format!(
                "invalid session id '{}', expected YYYY-MM-DD-HH-MM-SS",
                session_id
            ))
        })?;

        let path = download_root.join(session_id);
        tokio::fs::create_dir_all(path.join(PACKAGES_DIR)).await?;
        tokio::fs::create_dir_all(path.join(METS_DIR)).await?;
        debug!(path = %path.display(), "Opened staging directory");
        Ok(Self { path, started_at })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local start time, truncated to the second the directory is named after.
    pub fn started_at(&self) -> NaiveDateTime {
        self.started_at
    }

    /// Directory as recorded on the fetch job, with a trailing separator.
    pub fn download_directory(&self) -> String {
        format!("{}/", self.path.display())
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.path.join(PACKAGES_DIR)
    }

    /// `packages{n}.json`, `n` starting at 1.
    pub fn package_list_path(&self, page_number: usize) -> PathBuf {
        self.packages_dir().join(format!("packages{}.json", page_number))
    }

    pub fn mets_path(&self, batch: usize, package_uuid: &str) -> PathBuf {
        self.path
            .join(METS_DIR)
            .join(batch.to_string())
            .join(format!("{}.xml", package_uuid))
    }

    pub fn package_index_path(&self) -> PathBuf {
        self.packages_dir().join(PACKAGE_INDEX_FILE)
    }

    /// Write a package page as received, pretty-printed with a four-space indent.
    pub async fn write_package_list(&self, page_number: usize, raw: &Value) -> Result<PathBuf> {
        let path = self.package_list_path(page_number);
        write_pretty(&path, raw).await?;
        Ok(path)
    }

    pub async fn write_package_index(&self, raw: &Value) -> Result<PathBuf> {
        let path = self.package_index_path();
        write_pretty(&path, raw).await?;
        Ok(path)
    }

    /// The cached full index, or `None` when this session has none yet.
    pub async fn read_package_index(&self) -> Result<Option<PackagePage>> {
        match tokio::fs::read(self.package_index_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_package_list(&self, page_number: usize) {
        let path = self.package_list_path(page_number);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Could not remove package list");
        }
    }
}

async fn write_pretty(path: &Path, raw: &Value) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(PACKAGE_LIST_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    raw.serialize(&mut serializer)?;
    tokio::fs::write(path, buf).await?;
    Ok(())
}

/// Remove a fetch job's staging directory.
///
/// Both paths are canonicalized first and only directories strictly inside
/// `download_root` are touched. Returns whether anything was removed.
pub async fn remove_download_directory(download_root: &Path, download_directory: &str) -> Result<bool> {
    let Some(root) = canonical(download_root).await? else {
        return Ok(false);
    };
    let Some(dir) = canonical(Path::new(download_directory)).await? else {
        return Ok(false);
    };

    if !dir.starts_with(&root) || dir == root {
        warn!(
            directory = %dir.display(),
            root = %root.display(),
            "Staging directory is outside the download root, leaving it in place"
        );
        return Ok(false);
    }

    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn canonical(path: &Path) -> Result<Option<PathBuf>> {
    match tokio::fs::canonicalize(path).await {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
