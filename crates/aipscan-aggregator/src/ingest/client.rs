//! HTTP client for the storage service API
//!
//! Errors never carry a credentialed URL: every URL is sanitized before it is
//! stored in an [`AggregatorError::Transport`], and `reqwest` errors are
//! stripped of theirs.

use super::endpoints::{self, sanitize_url};
use super::package::PackagePage;
use crate::config::{AggregatorConfig, USER_AGENT};
use crate::db::StorageService;
use crate::error::{AggregatorError, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// A package page together with the JSON it was decoded from, so the page
/// can be staged exactly as received.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page: PackagePage,
    pub raw: Value,
}

#[derive(Clone)]
pub struct StorageServiceClient {
    client: Client,
}

impl StorageServiceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AggregatorError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_config(config: &AggregatorConfig) -> Result<Self> {
        Self::new(config.http_timeout())
    }

    /// Request one page of the package index.
    pub async fn request_package_page(
        &self,
        service: &StorageService,
        offset: i64,
        limit: i64,
    ) -> Result<FetchedPage> {
        self.fetch_page(endpoints::package_list_url(service, offset, limit)?).await
    }

    /// Follow `meta.next` from a previous page.
    pub async fn request_next_page(&self, service: &StorageService, next: &str) -> Result<FetchedPage> {
        self.fetch_page(endpoints::next_page_url(service, next)).await
    }

    async fn fetch_page(&self, url: String) -> Result<FetchedPage> {
        let raw = self.get_json(&url).await?;
        let page = serde_json::from_value::<PackagePage>(raw.clone()).map_err(|e| {
            AggregatorError::transport(sanitize_url(&url), format!("unexpected package page: {}", e))
        })?;

        debug!(
            url = %sanitize_url(&url),
            objects = page.objects.len(),
            total_count = page.meta.total_count,
            "Fetched package page"
        );
        Ok(FetchedPage { page, raw })
    }

    /// Stream the bytes of one file inside a stored package.
    pub async fn extract_file(
        &self,
        service: &StorageService,
        package_uuid: &str,
        relative_path: &str,
    ) -> Result<impl Stream<Item = Result<Vec<u8>>> + Send + 'static> {
        let url = endpoints::extract_file_url(service, package_uuid, relative_path)?;
        let response = self.get(&url).await?;
        let sanitized = sanitize_url(&url);

        Ok(response.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| AggregatorError::from_reqwest(sanitized.clone(), e))
        }))
    }

    /// `description` of a storage location, if the service reports one.
    pub async fn location_description(
        &self,
        service: &StorageService,
        current_location: &str,
    ) -> Result<Option<String>> {
        self.resource_field(service, current_location, "description").await
    }

    /// `remote_name` of a pipeline, used as its dashboard URL.
    pub async fn pipeline_remote_name(
        &self,
        service: &StorageService,
        origin_pipeline: &str,
    ) -> Result<Option<String>> {
        self.resource_field(service, origin_pipeline, "remote_name").await
    }

    async fn resource_field(
        &self,
        service: &StorageService,
        api_path: &str,
        field: &str,
    ) -> Result<Option<String>> {
        let value = self.get_json(&endpoints::resource_url(service, api_path)?).await?;
        Ok(value
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    async fn get(&self, url: &str) -> Result<Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AggregatorError::from_reqwest(sanitize_url(url), e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(AggregatorError::transport(sanitize_url(url), format!("HTTP {}", status)));
        }
        Ok(response)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let body = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| AggregatorError::from_reqwest(sanitize_url(url), e))?;

        serde_json::from_slice(&body).map_err(|e| {
            AggregatorError::transport(sanitize_url(url), format!("response is not JSON: {}", e))
        })
    }
}
