//! Error taxonomy for the aggregation pipeline.
//!
//! URLs carried by [`AggregatorError::Transport`] are always sanitized by the
//! caller; `reqwest` errors are stripped of their URL before being stored.

use aipscan_common::CommonError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Coarse error classes used to pick a handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Mets,
    Package,
    Storage,
    Io,
    Config,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum AggregatorError {
    /// Non-200 response, unreachable host or a body that is not the JSON
    /// we asked for.
    #[error("Storage service request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("METS error: {0}")]
    Mets(String),

    /// Raised when a descriptor is used in a way its classification forbids.
    #[error("Package error: {0}")]
    Package(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid package list: {0}")]
    PackageList(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Fetch job {0} was cancelled")]
    Cancelled(i64),

    #[error("Page {page} would start at package {start_item} but there are only {total} packages")]
    PageOutOfRange { page: u64, start_item: u64, total: u64 },

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl AggregatorError {
    /// Build a transport error. `url` must already be sanitized.
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Wrap a `reqwest` error without leaking the credentialed URL it carries.
    pub fn from_reqwest(url: impl Into<String>, err: reqwest::Error) -> Self {
        Self::transport(url, err.without_url().to_string())
    }

    pub fn mets(msg: impl Into<String>) -> Self {
        Self::Mets(msg.into())
    }

    pub fn package(msg: impl Into<String>) -> Self {
        Self::Package(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(resource_type: &str, identifier: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}' not found", resource_type, identifier))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::PackageList(_) => ErrorKind::Transport,
            Self::Mets(_) => ErrorKind::Mets,
            Self::Package(_) => ErrorKind::Package,
            Self::Storage(_) | Self::Migration(_) | Self::NotFound(_) => ErrorKind::Storage,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) | Self::Common(_) | Self::PageOutOfRange { .. } => ErrorKind::Config,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// True when the error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Storage(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}
