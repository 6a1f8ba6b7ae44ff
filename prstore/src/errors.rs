use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Synchronization failed: {0}")]
    SyncError(String),

    #[error("Warehouse operation failed: {0}")]
    Warehouse(String),

    #[error("Embedding request failed: {0}")]
    Embedding(String),

    #[error("Source rate limit exhausted until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("Source resource not found: {0}")]
    SourceNotFound(String),

    #[error("Transient source failure: {0}")]
    TransientSource(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
