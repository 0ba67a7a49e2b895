//! Package records from the storage service and their classification.

use crate::db::FetchJobTotals;
use crate::error::{AggregatorError, Result};
use serde::{Deserialize, Serialize};

/// Length of `"0000-0000-0000-0000-0000-0000-0000-0000-"`, the pair-tree
/// prefix in front of every stored package path.
pub const PAIR_TREE_PREFIX_LEN: usize = 40;

const COMPRESSED_SUFFIX: &str = ".7z";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub total_count: u64,
    #[serde(default)]
    pub next: Option<String>,
}

/// One page of `GET /api/v2/file/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePage {
    pub meta: PageMeta,
    #[serde(default)]
    pub objects: Vec<PackageRecord>,
}

/// The fields of a package record the pipeline relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageRecord {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub package_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub replicated_package: Option<String>,
    #[serde(default)]
    pub current_path: Option<String>,
    #[serde(default)]
    pub current_location: Option<String>,
    #[serde(default)]
    pub origin_pipeline: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

/// Exactly one of these holds for a classified package, if any does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Aip,
    Dip,
    Sip,
    Replica,
    Deleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub uuid: Option<String>,
    pub current_path: Option<String>,
    pub current_location: Option<String>,
    pub origin_pipeline: Option<String>,
    pub size: Option<i64>,
    pub aip: bool,
    pub dip: bool,
    pub sip: bool,
    pub replica: bool,
    pub deleted: bool,
}

impl PackageDescriptor {
    pub fn classify(record: &PackageRecord) -> Self {
        let package_type = record.package_type.as_deref().unwrap_or_default();

        Self {
            uuid: record.uuid.clone(),
            current_path: record.current_path.clone(),
            current_location: record.current_location.clone(),
            origin_pipeline: record.origin_pipeline.clone(),
            size: record.size,
            aip: package_type == "AIP",
            dip: package_type == "DIP",
            // Transfers are reported as `transfer` by the storage service.
            sip: matches!(package_type, "SIP" | "transfer"),
            replica: record.replicated_package.is_some(),
            deleted: record.status.as_deref() == Some("DELETED"),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_replica(&self) -> bool {
        self.replica && self.aip && !self.deleted && !self.dip && !self.sip
    }

    pub fn is_aip(&self) -> bool {
        self.aip && !self.deleted && !self.replica && !self.dip && !self.sip
    }

    pub fn is_dip(&self) -> bool {
        self.dip && !self.deleted && !self.aip && !self.sip
    }

    pub fn is_sip(&self) -> bool {
        self.sip && !self.deleted && !self.aip && !self.dip
    }

    pub fn is_undeleted_aip(&self) -> bool {
        self.is_aip() && !self.deleted
    }

    pub fn kind(&self) -> Option<PackageKind> {
        if self.is_deleted() {
            Some(PackageKind::Deleted)
        } else if self.is_replica() {
            Some(PackageKind::Replica)
        } else if self.is_aip() {
            Some(PackageKind::Aip)
        } else if self.is_dip() {
            Some(PackageKind::Dip)
        } else if self.is_sip() {
            Some(PackageKind::Sip)
        } else {
            None
        }
    }

    /// Path of the METS file inside the stored package, as expected by
    /// `extract_file`.
    pub fn relative_mets_path(&self) -> Result<String> {
        if self.dip || self.sip || self.replica || self.deleted || !self.aip {
            return Err(AggregatorError::package(format!(
                "package {} is not an undeleted AIP",
                self.uuid.as_deref().unwrap_or("<unknown>")
            )));
        }
        let uuid = self
            .uuid
            .as_deref()
            .ok_or_else(|| AggregatorError::package("AIP record has no uuid"))?;
        let current_path = self.current_path.as_deref().ok_or_else(|| {
            AggregatorError::package(format!("AIP {} has no current_path", uuid))
        })?;

        let stripped: String = current_path.chars().skip(PAIR_TREE_PREFIX_LEN).collect();
        let stripped = stripped.strip_suffix(COMPRESSED_SUFFIX).unwrap_or(&stripped);

        Ok(format!("{}/data/METS.{}.xml", stripped, uuid))
    }
}

/// Running counts of classified packages for fetch-job finalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageTally {
    pub aips: i64,
    pub dips: i64,
    pub sips: i64,
    pub replicas: i64,
    pub deleted: i64,
    pub unclassified: i64,
}

impl PackageTally {
    pub fn record(&mut self, descriptor: &PackageDescriptor) {
        match descriptor.kind() {
            Some(PackageKind::Aip) => self.aips += 1,
            Some(PackageKind::Dip) => self.dips += 1,
            Some(PackageKind::Sip) => self.sips += 1,
            Some(PackageKind::Replica) => self.replicas += 1,
            Some(PackageKind::Deleted) => self.deleted += 1,
            None => self.unclassified += 1,
        }
    }

    pub fn totals(&self, total_packages: u64) -> FetchJobTotals {
        FetchJobTotals {
            total_packages: i64::try_from(total_packages).unwrap_or(i64::MAX),
            total_aips: self.aips,
            total_dips: self.dips,
            total_sips: self.sips,
            total_replicas: self.replicas,
            total_deleted_aips: self.deleted,
        }
    }
}
