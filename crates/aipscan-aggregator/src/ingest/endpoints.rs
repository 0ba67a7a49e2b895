//! Storage service URL builders
//!
//! Every URL built here carries the service credentials in its query string.
//! Pass it through [`sanitize_url`] before it reaches a log line or an error.

use crate::db::StorageService;
use crate::error::{AggregatorError, Result};
use reqwest::Url;

const CREDENTIAL_PARAMS: [&str; 2] = ["username", "api_key"];

fn base_url(service: &StorageService) -> &str {
    service.url.trim_end_matches('/')
}

/// Parse `url` and append `params` plus the credentials, percent-encoded.
fn with_query(service: &StorageService, url: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut url = Url::parse(url).map_err(|e| {
        AggregatorError::config(format!("invalid storage service URL '{}': {}", base_url(service), e))
    })?;
    url.query_pairs_mut()
        .extend_pairs(params)
        .append_pair("username", &service.user_name)
        .append_pair("api_key", &service.api_key);
    Ok(url.into())
}

/// Build the package index URL for one page
pub fn package_list_url(service: &StorageService, offset: i64, limit: i64) -> Result<String> {
    let (limit, offset) = (limit.to_string(), offset.to_string());
    with_query(
        service,
        &format!("{}/api/v2/file/", base_url(service)),
        &[("limit", &limit), ("offset", &offset)],
    )
}

/// Build the URL of a follow-up page from the opaque `meta.next` value
pub fn next_page_url(service: &StorageService, next: &str) -> String {
    format!("{}{}", base_url(service), next)
}

/// Build the URL extracting one file from a stored package
pub fn extract_file_url(service: &StorageService, package_uuid: &str, relative_path: &str) -> Result<String> {
    with_query(
        service,
        &format!("{}/api/v2/file/{}/extract_file/", base_url(service), package_uuid),
        &[("relative_path_to_file", relative_path)],
    )
}

/// Build the URL of a location or pipeline resource, e.g. `/api/v2/location/<uuid>/`
pub fn resource_url(service: &StorageService, api_path: &str) -> Result<String> {
    let url = format!("{}{}", base_url(service), api_path);
    with_query(service, url.trim_end_matches('/'), &[])
}

/// Remove the `username` and `api_key` query parameters from `url`.
///
/// A URL that does not parse loses its whole query string.
pub fn sanitize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.split_once('?').map_or(url, |(path, _)| path).to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !CREDENTIAL_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    parsed.set_query(None);
    if !kept.is_empty() {
        parsed.query_pairs_mut().extend_pairs(&kept);
    }
    parsed.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn service(url: &str) -> StorageService {
        StorageService {
            id: 1,
            name: "ss".into(),
            url: url.into(),
            user_name: "test".into(),
            api_key: "s3cr3t".into(),
            download_limit: 20,
            download_offset: 0,
            is_default: true,
        }
    }

    #[test]
    fn test_package_list_url() {
        assert_eq!(
            package_list_url(&service("http://ss:8000/"), 40, 20).unwrap(),
            "http://ss:8000/api/v2/file/?limit=20&offset=40&username=test&api_key=s3cr3t"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = package_list_url(&service("not a url"), 0, 20).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(!err.to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_next_page_url_keeps_query() {
        let next = "/api/v2/file/?limit=20&offset=20&username=test&api_key=s3cr3t";
        assert_eq!(
            next_page_url(&service("http://ss:8000//"), next),
            format!("http://ss:8000{}", next)
        );
    }

    #[test]
    fn test_extract_file_url() {
        let url = extract_file_url(&service("http://ss"), "abc", "t-abc/data/METS.abc.xml").unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/api/v2/file/abc/extract_file/");
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            [
                ("relative_path_to_file".to_string(), "t-abc/data/METS.abc.xml".to_string()),
                ("username".to_string(), "test".to_string()),
                ("api_key".to_string(), "s3cr3t".to_string()),
            ]
        );
    }

    #[test]
    fn test_resource_url_trims_trailing_slash() {
        assert_eq!(
            resource_url(&service("http://ss/"), "/api/v2/location/L1/").unwrap(),
            "http://ss/api/v2/location/L1?username=test&api_key=s3cr3t"
        );
    }

    #[test]
    fn test_credentials_are_encoded() {
        let mut ss = service("http://ss");
        ss.api_key = "k3y&leak=part#frag".into();
        ss.user_name = "a b".into();

        let url = package_list_url(&ss, 0, 20).unwrap();
        let parsed = Url::parse(&url).unwrap();
        let api_key = parsed.query_pairs().find(|(k, _)| k == "api_key").map(|(_, v)| v.into_owned());
        assert_eq!(api_key.as_deref(), Some("k3y&leak=part#frag"));
        assert!(parsed.query_pairs().all(|(k, _)| k != "leak"));

        let clean = sanitize_url(&url);
        assert_eq!(clean, "http://ss/api/v2/file/?limit=20&offset=0");
        assert!(!clean.contains("leak") && !clean.contains("part"), "{}", clean);
    }

    #[test]
    fn test_sanitize_url() {
        let ss = service("http://ss");
        for url in [
            package_list_url(&ss, 0, 20).unwrap(),
            extract_file_url(&ss, "abc", "x/data/METS.abc.xml").unwrap(),
            resource_url(&ss, "/api/v2/pipeline/P1/").unwrap(),
        ] {
            let clean = sanitize_url(&url);
            assert!(!clean.contains("username="), "{}", clean);
            assert!(!clean.contains("api_key="), "{}", clean);
            assert!(!clean.contains("s3cr3t"), "{}", clean);
        }

        assert_eq!(
            sanitize_url("http://ss/api/v2/file/?limit=20&username=u&offset=0&api_key=k"),
            "http://ss/api/v2/file/?limit=20&offset=0"
        );
        assert_eq!(sanitize_url("http://ss/api/v2/location/L1?username=u&api_key=k"), "http://ss/api/v2/location/L1");
        assert_eq!(sanitize_url("http://ss/health"), "http://ss/health");
        assert_eq!(sanitize_url("ss/api?api_key=k"), "ss/api");
    }
}
