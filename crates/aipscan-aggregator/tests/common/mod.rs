//! Shared fixtures for aggregator integration tests
//!
//! Each [`TestEnv`] owns a temporary SQLite database, a temporary download
//! root and a wiremock storage service, so tests can run in parallel.

#![allow(dead_code)]

use aipscan_aggregator::config::{AggregatorConfig, DatabaseConfig};
use aipscan_aggregator::db::{NewStorageService, StorageService, Store};
use aipscan_aggregator::ingest::{FetchCoordinator, StorageServiceClient};
use anyhow::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AIP_UUID: &str = "ab793f82-27b0-4c2e-ac3e-621bab5af8f1";
pub const ORIGINAL_UUID: &str = "1e2a3b4c-5d6e-4f70-8a9b-0c1d2e3f4a5b";
pub const PRESERVATION_UUID: &str = "9f8e7d6c-5b4a-4392-8170-6f5e4d3c2b1a";

pub const LOCATION: &str = "/api/v2/location/3ae3a2b8-7b54-4fb5-9d0b-b57e2e2a1b7c/";
pub const PIPELINE: &str = "/api/v2/pipeline/5c0e9a1f-7d2b-4b8e-9c3a-1f2e3d4c5b6a/";

pub const USER: &str = "test";
pub const API_KEY: &str = "s3cr3t";

const METS_TEMPLATE: &str = include_str!("../fixtures/METS.template.xml");

/// METS for [`AIP_UUID`] with one original and one preservation file.
///
/// `extra_events` is spliced into the original file's amdSec.
pub fn mets_xml(transfer_name: &str, extra_events: &str) -> String {
    METS_TEMPLATE
        .replace("{{TRANSFER_NAME}}", transfer_name)
        .replace("{{TRANSFER_UUID}}", AIP_UUID)
        .replace("{{ORIGINAL_UUID}}", ORIGINAL_UUID)
        .replace("{{PRESERVATION_UUID}}", PRESERVATION_UUID)
        .replace("<!--EXTRA_EVENTS-->", extra_events)
}

/// A digiprovMD wrapping one PREMIS event linked to the Archivematica agent.
pub fn premis_event(id: &str, event_uuid: &str, event_type: &str, date: &str) -> String {
    format!(
        r#"<mets:digiprovMD ID="{id}">
      <mets:mdWrap MDTYPE="PREMIS:EVENT">
        <mets:xmlData>
          <premis:event>
            <premis:eventIdentifier>
              <premis:eventIdentifierType>UUID</premis:eventIdentifierType>
              <premis:eventIdentifierValue>{event_uuid}</premis:eventIdentifierValue>
            </premis:eventIdentifier>
            <premis:eventType>{event_type}</premis:eventType>
            <premis:eventDateTime>{date}</premis:eventDateTime>
            <premis:eventOutcomeInformation>
              <premis:eventOutcome>Pass</premis:eventOutcome>
            </premis:eventOutcomeInformation>
            <premis:linkingAgentIdentifier>
              <premis:linkingAgentIdentifierType>preservation system</premis:linkingAgentIdentifierType>
              <premis:linkingAgentIdentifierValue>Archivematica-1.10</premis:linkingAgentIdentifierValue>
            </premis:linkingAgentIdentifier>
          </premis:event>
        </mets:xmlData>
      </mets:mdWrap>
    </mets:digiprovMD>"#
    )
}

/// Pair-tree `current_path` of a compressed AIP.
pub fn current_path(uuid: &str, transfer_name: &str) -> String {
    let hex: String = uuid.chars().filter(|c| *c != '-').collect();
    let pair_tree: Vec<String> = hex
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    format!("{}/{}-{}.7z", pair_tree.join("/"), transfer_name, uuid)
}

/// Relative METS path the worker requests for [`current_path`].
pub fn relative_mets_path(uuid: &str, transfer_name: &str) -> String {
    format!("{}-{}/data/METS.{}.xml", transfer_name, uuid, uuid)
}

pub fn package_record(uuid: &str, package_type: &str, status: &str) -> Value {
    json!({
        "uuid": uuid,
        "package_type": package_type,
        "status": status,
        "replicated_package": null,
        "current_path": current_path(uuid, "mytransfer"),
        "current_location": LOCATION,
        "origin_pipeline": PIPELINE,
        "size": 12345,
        "encrypted": false,
        "misc_attributes": {},
        "resource_uri": format!("/api/v2/file/{}/", uuid)
    })
}

pub fn aip_record(uuid: &str) -> Value {
    package_record(uuid, "AIP", "UPLOADED")
}

pub fn page(total_count: u64, next: Option<&str>, objects: Vec<Value>) -> Value {
    json!({
        "meta": {
            "limit": 20,
            "next": next,
            "offset": 0,
            "previous": null,
            "total_count": total_count
        },
        "objects": objects
    })
}

pub struct TestEnv {
    pub dir: TempDir,
    pub store: Store,
    pub config: AggregatorConfig,
    pub server: MockServer,
    pub service: StorageService,
}

impl TestEnv {
    pub async fn start() -> Result<Self> {
        Self::start_with_limit(20).await
    }

    pub async fn start_with_limit(download_limit: i64) -> Result<Self> {
        let dir = TempDir::new()?;
        let database = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("aipscan.db").display()),
            max_connections: 4,
            busy_timeout_secs: 10,
        };
        let config = AggregatorConfig {
            database,
            ..AggregatorConfig::default()
        }
        .with_download_root(dir.path().join("downloads"))
        .with_worker_concurrency(2);

        let store = Store::open(&config.database).await?;
        let server = MockServer::start().await;
        let service = store
            .create_storage_service(
                &NewStorageService::new("Test storage service", server.uri(), USER, API_KEY)
                    .with_page(download_limit, 0)
                    .as_default(true),
            )
            .await?;

        Ok(Self {
            dir,
            store,
            config,
            server,
            service,
        })
    }

    pub fn download_root(&self) -> PathBuf {
        self.config.download_root.clone()
    }

    pub fn coordinator(&self) -> FetchCoordinator {
        let client = StorageServiceClient::from_config(&self.config).expect("http client");
        FetchCoordinator::with_client(self.store.clone(), client, self.config.clone())
    }

    /// Serve a single index page at offset 0.
    pub async fn mount_index(&self, objects: Vec<Value>) {
        let total = objects.len() as u64;
        Mock::given(method("GET"))
            .and(path("/api/v2/file/"))
            .and(query_param("offset", "0"))
            .and(query_param("username", USER))
            .and(query_param("api_key", API_KEY))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(total, None, objects)))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_mets(&self, uuid: &str, body: impl Into<Vec<u8>>) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v2/file/{}/extract_file/", uuid)))
            .and(query_param("relative_path_to_file", relative_mets_path(uuid, "mytransfer")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.into()))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_location_and_pipeline(&self) {
        Mock::given(method("GET"))
            .and(path(LOCATION.trim_end_matches('/')))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"description": "AIP Store", "purpose": "AS"})),
            )
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(PIPELINE.trim_end_matches('/')))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"remote_name": "http://dashboard.example", "uuid": "P1"})),
            )
            .mount(&self.server)
            .await;
    }

    /// Mount everything one clean AIP ingestion needs.
    pub async fn mount_single_aip(&self, mets: &str) {
        self.mount_index(vec![aip_record(AIP_UUID)]).await;
        self.mount_mets(AIP_UUID, mets.as_bytes().to_vec()).await;
        self.mount_location_and_pipeline().await;
    }

    pub async fn aip_count(&self, uuid: &str) -> Result<usize> {
        Ok(self.store.aips_by_uuid(uuid).await?.len())
    }
}
