//! Aggregator configuration loaded from the environment.

use crate::error::{AggregatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default SQLite database file, created on first connect.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://aipscan.db";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_DATABASE_BUSY_TIMEOUT_SECS: u64 = 30;

/// Concurrent METS ingestions per fetch job.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Ingestion tasks buffered between the coordinator and the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

pub const USER_AGENT: &str = concat!("aipscan-aggregator/", env!("CARGO_PKG_VERSION"));

/// Package-local staging root used when `AGGREGATOR_DOWNLOAD_ROOT` is unset.
pub fn default_download_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("downloads")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            busy_timeout_secs: DEFAULT_DATABASE_BUSY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub database: DatabaseConfig,
    /// Root of the per-fetch-job staging directories.
    pub download_root: PathBuf,
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    pub http_timeout_secs: u64,
    /// Delete each `packages{n}.json` once it has been classified.
    pub remove_package_lists: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            download_root: default_download_root(),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            remove_package_lists: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AggregatorConfig {
    /// Load from the environment, reading a `.env` file first if present.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                busy_timeout_secs: env_parse(
                    "DATABASE_BUSY_TIMEOUT",
                    DEFAULT_DATABASE_BUSY_TIMEOUT_SECS,
                ),
            },
            download_root: std::env::var("AGGREGATOR_DOWNLOAD_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_download_root()),
            worker_concurrency: env_parse(
                "AGGREGATOR_WORKER_CONCURRENCY",
                DEFAULT_WORKER_CONCURRENCY,
            ),
            queue_capacity: env_parse("AGGREGATOR_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            http_timeout_secs: env_parse("AGGREGATOR_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            remove_package_lists: env_parse("AGGREGATOR_REMOVE_PACKAGE_LISTS", false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(AggregatorError::config("DATABASE_URL cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(AggregatorError::config("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }
        if self.worker_concurrency == 0 {
            return Err(AggregatorError::config(
                "AGGREGATOR_WORKER_CONCURRENCY must be greater than 0",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(AggregatorError::config("AGGREGATOR_QUEUE_CAPACITY must be greater than 0"));
        }
        if self.http_timeout_secs == 0 {
            return Err(AggregatorError::config(
                "AGGREGATOR_HTTP_TIMEOUT_SECS must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = root.into();
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }
}
