use chrono::{DateTime, Utc};
use prstore::errors::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("rate limit exhausted until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("request to {url} failed after {attempts} attempts: {message}")]
    Transient {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("GitHub API returned {status} for {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

impl From<FetchError> for StorageError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { reset_at } => StorageError::RateLimited { reset_at },
            FetchError::NotFound(what) => StorageError::SourceNotFound(what),
            FetchError::Transient { .. } => StorageError::TransientSource(err.to_string()),
            FetchError::InvalidParam(msg) => StorageError::InvalidArg(msg),
            other => StorageError::SyncError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
