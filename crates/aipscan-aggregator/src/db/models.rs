//! Row types for the aggregation schema.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use sqlx::FromRow;
use std::sync::LazyLock;

static UUID_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]{8}-([0-9a-f]{4}-){3}[0-9a-f]{12}"));

/// First lowercase UUID embedded in `value`, e.g. in `/api/v2/location/<uuid>/`.
pub fn extract_uuid(value: &str) -> Option<&str> {
    UUID_PATTERN
        .as_ref()
        .ok()
        .and_then(|re| re.find(value))
        .map(|m| m.as_str())
}

#[derive(Clone, FromRow, Serialize)]
pub struct StorageService {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub download_limit: i64,
    pub download_offset: i64,
    pub is_default: bool,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("user_name", &self.user_name)
            .field("api_key", &"<redacted>")
            .field("download_limit", &self.download_limit)
            .field("download_offset", &self.download_offset)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Input for creating or updating a storage service.
#[derive(Clone)]
pub struct NewStorageService {
    pub name: String,
    pub url: String,
    pub user_name: String,
    pub api_key: String,
    pub download_limit: i64,
    pub download_offset: i64,
    pub is_default: bool,
}

impl NewStorageService {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        user_name: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            user_name: user_name.into(),
            api_key: api_key.into(),
            download_limit: 20,
            download_offset: 0,
            is_default: false,
        }
    }

    pub fn as_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.download_limit = limit;
        self.download_offset = offset;
        self
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StorageLocation {
    pub id: i64,
    pub current_location: String,
    pub description: Option<String>,
    pub storage_service_id: i64,
}

impl StorageLocation {
    pub fn uuid(&self) -> Option<&str> {
        extract_uuid(&self.current_location)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Pipeline {
    pub id: i64,
    pub origin_pipeline: String,
    pub dashboard_url: Option<String>,
}

impl Pipeline {
    pub fn uuid(&self) -> Option<&str> {
        extract_uuid(&self.origin_pipeline)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FetchJob {
    pub id: i64,
    pub total_packages: Option<i64>,
    pub total_aips: Option<i64>,
    pub total_dips: Option<i64>,
    pub total_sips: Option<i64>,
    pub total_replicas: Option<i64>,
    pub total_deleted_aips: Option<i64>,
    pub download_start: NaiveDateTime,
    pub download_end: Option<NaiveDateTime>,
    pub download_directory: String,
    pub storage_service_id: i64,
}

impl FetchJob {
    /// A job without an end timestamp either is running or was aborted.
    pub fn is_complete(&self) -> bool {
        self.download_end.is_some()
    }
}

/// Aggregate counts written once when a fetch job is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchJobTotals {
    pub total_packages: i64,
    pub total_aips: i64,
    pub total_dips: i64,
    pub total_sips: i64,
    pub total_replicas: i64,
    pub total_deleted_aips: i64,
}

impl FetchJobTotals {
    pub fn summary(&self) -> String {
        format!(
            "aips: '{}'; sips: '{}'; dips: '{}'; deleted: '{}'; replicated: '{}'",
            self.total_aips,
            self.total_sips,
            self.total_dips,
            self.total_deleted_aips,
            self.total_replicas
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Aip {
    pub id: i64,
    pub uuid: String,
    pub transfer_name: String,
    pub create_date: NaiveDateTime,
    pub mets_sha256: Option<String>,
    pub size: Option<i64>,
    pub originals_count: Option<i64>,
    pub copies_count: Option<i64>,
    pub storage_service_id: i64,
    pub storage_location_id: Option<i64>,
    pub fetch_job_id: i64,
    pub origin_pipeline_id: Option<i64>,
}

/// Everything needed to insert an AIP row; counts are filled in later.
#[derive(Debug, Clone)]
pub struct NewAip {
    pub uuid: String,
    pub transfer_name: String,
    pub create_date: NaiveDateTime,
    pub mets_sha256: String,
    pub size: Option<i64>,
    pub storage_service_id: i64,
    pub storage_location_id: Option<i64>,
    pub fetch_job_id: i64,
    pub origin_pipeline_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Original,
    Preservation,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Original => "original",
            FileType::Preservation => "preservation",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct File {
    pub id: i64,
    pub aip_id: i64,
    pub uuid: String,
    pub name: Option<String>,
    pub filepath: Option<String>,
    pub size: Option<i64>,
    pub date_created: Option<NaiveDateTime>,
    pub puid: Option<String>,
    pub file_format: Option<String>,
    pub format_version: Option<String>,
    pub checksum_type: Option<String>,
    pub checksum_value: Option<String>,
    pub file_type: String,
    pub original_file_id: Option<i64>,
}

impl File {
    pub fn is_preservation(&self) -> bool {
        self.file_type == FileType::Preservation.as_str()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Event {
    pub id: i64,
    pub file_id: i64,
    pub event_type: Option<String>,
    pub uuid: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub detail: Option<String>,
    pub outcome: Option<String>,
    pub outcome_detail: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Agent {
    pub id: i64,
    pub linking_type_value: String,
    pub agent_type: Option<String>,
    pub agent_value: Option<String>,
    pub storage_service_id: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_uuid() {
        assert_eq!(
            extract_uuid("/api/v2/location/3ae3a2b8-7b54-4fb5-9d0b-b57e2e2a1b7c/"),
            Some("3ae3a2b8-7b54-4fb5-9d0b-b57e2e2a1b7c")
        );
        assert_eq!(extract_uuid("/api/v2/location/L1/"), None);
    }

    #[test]
    fn test_api_key_not_in_debug() {
        let service = StorageService {
            id: 1,
            name: "ss".into(),
            url: "http://ss".into(),
            user_name: "test".into(),
            api_key: "s3cr3t".into(),
            download_limit: 20,
            download_offset: 0,
            is_default: true,
        };
        assert!(!format!("{:?}", service).contains("s3cr3t"));
        assert!(!serde_json::to_string(&service).unwrap().contains("s3cr3t"));
    }

    #[test]
    fn test_totals_summary() {
        let totals = FetchJobTotals {
            total_packages: 9,
            total_aips: 4,
            total_dips: 1,
            total_sips: 2,
            total_replicas: 1,
            total_deleted_aips: 1,
        };
        assert_eq!(
            totals.summary(),
            "aips: '4'; sips: '2'; dips: '1'; deleted: '1'; replicated: '1'"
        );
    }
}
