//! Error types shared by AIPscan crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid logging configuration: {0}")]
    Logging(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

impl CommonError {
    pub fn logging(msg: impl Into<String>) -> Self {
        Self::Logging(msg.into())
    }
}
