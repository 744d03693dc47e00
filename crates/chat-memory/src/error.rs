//! Error types for the memory subsystem.

use std::time::Duration;
use thiserror::Error;

/// Failures of the durable snapshot medium.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the summarizer capability.
#[derive(Error, Debug)]
pub enum SummarizerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Summarizer API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("Summarizer returned an empty summary")]
    EmptyResponse,

    #[error("Summarization timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Snapshot store error: {0}")]
    Store(#[from] StoreError),

    #[error("Summarizer error: {0}")]
    Summarizer(#[from] SummarizerError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        MemoryError::Task(err.to_string())
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
