use crate::errors::{Result, StorageError};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub cache_path: PathBuf,
    pub catalog_path: PathBuf,
    pub warehouse_path: PathBuf,
}

impl StorageConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            cache_path: base_path.join("cache"),
            catalog_path: base_path.join("catalog.sqlite"),
            warehouse_path: base_path.join("warehouse.sqlite"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    #[default]
    Disabled,
    OpenAi,
    FastEmbed,
}

impl EmbeddingBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "disabled" => Ok(Self::Disabled),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "fastembed" | "fast_embed" | "local" => Ok(Self::FastEmbed),
            other => Err(StorageError::Config(format!(
                "unknown embedding provider '{other}'"
            ))),
        }
    }
}

/// Embedding backend selection plus the model constants it is pinned to.
#[derive(Deserialize, Debug, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    768
}

fn default_batch_size() -> usize {
    5
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_model(),
            dimension: default_dimension(),
            batch_size: default_batch_size(),
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    /// Reads `EMBEDDING_PROVIDER`, `EMBEDDING_MODEL`, `EMBEDDING_DIMENSION`,
    /// `EMBEDDING_BATCH_SIZE`, `EMBEDDING_BASE_URL` and `OPENAI_API_KEY`,
    /// after loading a `.env` file if one exists.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(value) = env::var("EMBEDDING_PROVIDER") {
            config.backend = EmbeddingBackend::parse(&value)?;
        }
        if let Ok(value) = env::var("EMBEDDING_MODEL") {
            config.model = value;
        }
        if let Ok(value) = env::var("EMBEDDING_DIMENSION") {
            config.dimension = parse_number("EMBEDDING_DIMENSION", &value)?;
        }
        if let Ok(value) = env::var("EMBEDDING_BATCH_SIZE") {
            config.batch_size = parse_number("EMBEDDING_BATCH_SIZE", &value)?;
        }
        if let Ok(value) = env::var("EMBEDDING_BASE_URL") {
            config.base_url = value;
        }
        config.api_key = env::var("OPENAI_API_KEY").ok().filter(|key| !key.is_empty());

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoaderConfig {
    /// Staging rows older than this are purged before the next append.
    #[serde(default = "default_staging_retention_hours")]
    pub staging_retention_hours: i64,
}

fn default_staging_retention_hours() -> i64 {
    72
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            staging_retention_hours: default_staging_retention_hours(),
        }
    }
}

impl LoaderConfig {
    pub fn staging_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staging_retention_hours)
    }
}

pub(crate) fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StorageError::Config(format!("{name} must be a number, got '{value}'")))
}
