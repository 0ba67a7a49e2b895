//! Relational store for the aggregation pipeline.
//!
//! Every public method on [`Store`] is one short unit of work: it either runs
//! a single autocommit statement or opens and commits its own transaction.
//! No connection is held between calls, so each operation starts from a
//! fresh snapshot.

mod agents;
mod aips;
mod fetch_jobs;
mod locations;
pub mod models;
mod storage_services;

pub use models::*;

use crate::config::DatabaseConfig;
use crate::error::{AggregatorError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open (creating if needed) the SQLite database and apply migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| AggregatorError::config(format!("invalid DATABASE_URL: {}", e)))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!(max_connections = config.max_connections, "Database ready");
    Ok(pool)
}

/// Retry [`connect`] until it succeeds or `timeout` elapses.
pub async fn connect_with_wait(config: &DatabaseConfig, timeout: Duration) -> Result<SqlitePool> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect(config).await {
            Ok(pool) => return Ok(pool),
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::warn!(attempt, error = %e, "Database not ready, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            },
            Err(e) => return Err(e),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
