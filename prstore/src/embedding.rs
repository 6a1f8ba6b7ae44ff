use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::errors::{Result, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>>;

    /// Expected vector length, when the backend has a fixed one.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

pub struct NullEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        Ok(vec![vec![]; texts.len()])
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    input: Vec<String>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f64>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

pub struct OpenAIProvider {
    api_key: String,
    model: String,
    endpoint: String,
    dimension: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| StorageError::Config("OPENAI_API_KEY is required".into()))?;
        url::Url::parse(&config.base_url).map_err(|e| {
            StorageError::Config(format!("invalid embedding base url '{}': {}", config.base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StorageError::Initialization(format!("HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            endpoint: embeddings_endpoint(&config.base_url),
            dimension: config.dimension,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request_once(
        &self,
        payload: &OpenAIRequest,
    ) -> std::result::Result<Vec<Vec<f64>>, AttemptError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("OpenAI API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("OpenAI API returned {}: {}", status, error_body);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                AttemptError::Retryable(message)
            } else {
                AttemptError::Fatal(message)
            });
        }

        let mut openai_response = response
            .json::<OpenAIResponse>()
            .await
            .map_err(|e| AttemptError::Fatal(format!("Failed to parse OpenAI response: {}", e)))?;
        openai_response.data.sort_by_key(|item| item.index);

        Ok(openai_response
            .data
            .into_iter()
            .map(|data| data.embedding)
            .collect())
    }
}

enum AttemptError {
    Retryable(String),
    Fatal(String),
}

fn embeddings_endpoint(base_url: &str) -> String {
    format!("{}/embeddings", base_url.trim_end_matches('/'))
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request_payload = OpenAIRequest {
            input: texts,
            model: self.model.clone(),
            dimensions: Some(self.dimension),
        };

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                log::warn!(
                    "Retrying embedding request in {:?} (attempt {}/{}): {}",
                    delay,
                    attempt,
                    self.max_retries,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }
            match self.request_once(&request_payload).await {
                Ok(vectors) => return Ok(vectors),
                Err(AttemptError::Retryable(message)) => last_error = message,
                Err(AttemptError::Fatal(message)) => return Err(StorageError::Embedding(message)),
            }
        }

        Err(StorageError::Embedding(last_error))
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }
}

#[cfg(feature = "local-embeddings")]
pub use local::FastEmbedProvider;

#[cfg(feature = "local-embeddings")]
mod local {
    use super::EmbeddingProvider;
    use crate::errors::{Result, StorageError};
    use async_trait::async_trait;
    use fastembed::{InitOptions, TextEmbedding};
    use std::sync::{Arc, Mutex};
    use tokio::task;

    pub struct FastEmbedProvider {
        model: Arc<Mutex<TextEmbedding>>,
    }

    impl FastEmbedProvider {
        pub fn new_default() -> Result<Self> {
            Self::new_with_options(Default::default())
        }

        pub fn new_with_options(options: InitOptions) -> Result<Self> {
            let embedding = TextEmbedding::try_new(options).map_err(|e| {
                StorageError::Initialization(format!("Failed to initialize FastEmbed model: {}", e))
            })?;
            Ok(Self {
                model: Arc::new(Mutex::new(embedding)),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastEmbedProvider {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            let model = Arc::clone(&self.model);
            task::spawn_blocking(move || -> Result<Vec<Vec<f64>>> {
                let mut guard = model
                    .lock()
                    .map_err(|_| StorageError::Embedding("FastEmbed model mutex poisoned".into()))?;
                let document_refs: Vec<_> = texts.iter().map(|s| s.as_str()).collect();
                let vectors = guard.embed(document_refs, None).map_err(|e| {
                    StorageError::Embedding(format!("FastEmbed embedding failed: {}", e))
                })?;
                Ok(vectors
                    .into_iter()
                    .map(|vec| vec.into_iter().map(|value| value as f64).collect())
                    .collect())
            })
            .await
            .map_err(|e| StorageError::Embedding(format!("FastEmbed task join error: {}", e)))?
        }
    }
}

/// Picks the backend named in `config`. The choice is fixed for the lifetime
/// of the returned provider.
pub fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.backend {
        EmbeddingBackend::Disabled => Ok(Arc::new(NullEmbeddingProvider)),
        EmbeddingBackend::OpenAi => Ok(Arc::new(OpenAIProvider::from_config(config)?)),
        #[cfg(feature = "local-embeddings")]
        EmbeddingBackend::FastEmbed => Ok(Arc::new(FastEmbedProvider::new_default()?)),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingBackend::FastEmbed => Err(StorageError::Config(
            "fastembed backend requires the `local-embeddings` feature".into(),
        )),
    }
}

/// Output of [`EmbeddingBatcher::embed`]: one slot per input text, in input
/// order. `None` marks blank text or a failed batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbeddedTexts {
    pub vectors: Vec<Option<Vec<f64>>>,
    pub failed_batches: usize,
}

impl EmbeddedTexts {
    /// Vectors with `None` replaced by the empty array stored for "no embedding".
    pub fn into_stored(self) -> Vec<Vec<f64>> {
        self.vectors
            .into_iter()
            .map(|slot| slot.unwrap_or_default())
            .collect()
    }
}

pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingBatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embeds `texts` in chunks of `batch_size`.
    ///
    /// Blank texts are never sent to the backend. A batch that errors, or
    /// comes back with the wrong number or length of vectors, nulls only its
    /// own slots.
    pub async fn embed<S: AsRef<str>>(&self, texts: &[S], batch_size: usize) -> EmbeddedTexts {
        let batch_size = batch_size.max(1);
        let mut vectors: Vec<Option<Vec<f64>>> = vec![None; texts.len()];
        let pending: Vec<(usize, String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.as_ref().trim().is_empty())
            .map(|(slot, text)| (slot, text.as_ref().to_string()))
            .collect();

        let mut failed_batches = 0;
        for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
            let inputs: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            match self.provider.embed(inputs).await {
                Ok(result) => match self.check_batch(&result, batch.len()) {
                    Ok(()) => {
                        for ((slot, _), vector) in batch.iter().zip(result) {
                            vectors[*slot] = Some(vector);
                        }
                    }
                    Err(reason) => {
                        failed_batches += 1;
                        log::warn!("Embedding batch {} discarded: {}", batch_no, reason);
                    }
                },
                Err(err) => {
                    failed_batches += 1;
                    log::warn!(
                        "Embedding batch {} ({} texts) failed: {}",
                        batch_no,
                        batch.len(),
                        err
                    );
                }
            }
        }

        EmbeddedTexts {
            vectors,
            failed_batches,
        }
    }

    fn check_batch(&self, result: &[Vec<f64>], expected: usize) -> std::result::Result<(), String> {
        if result.len() != expected {
            return Err(format!("expected {} vectors, got {}", expected, result.len()));
        }
        if let Some(dimension) = self.provider.dimension() {
            if let Some(bad) = result.iter().find(|v| v.len() != dimension) {
                return Err(format!(
                    "expected dimension {}, got {}",
                    dimension,
                    bad.len()
                ));
            }
        }
        Ok(())
    }

    /// Single-text mode. Blank input is a caller error here.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f64>> {
        if text.trim().is_empty() {
            return Err(StorageError::InvalidArg(
                "cannot embed empty text".to_string(),
            ));
        }
        let mut vectors = self.provider.embed(vec![text.to_string()]).await?;
        self.check_batch(&vectors, 1).map_err(StorageError::Embedding)?;
        Ok(vectors.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns `[len, 1.0]` per text and fails any batch containing "boom".
    struct RecordingProvider {
        calls: Mutex<Vec<Vec<String>>>,
        dimension: Option<usize>,
    }

    impl RecordingProvider {
        fn new(dimension: Option<usize>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                dimension,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            self.calls.lock().unwrap().push(texts.clone());
            if texts.iter().any(|t| t.contains("boom")) {
                return Err(StorageError::Embedding("backend unavailable".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f64, 1.0]).collect())
        }

        fn dimension(&self) -> Option<usize> {
            self.dimension
        }
    }

    #[tokio::test]
    async fn blanks_are_skipped_and_order_is_kept() {
        let provider = Arc::new(RecordingProvider::new(Some(2)));
        let batcher = EmbeddingBatcher::new(provider.clone());

        let texts = ["alpha", "", "  ", "gamma!", "\n"];
        let out = batcher.embed(&texts, 5).await;

        assert_eq!(
            out.vectors,
            vec![
                Some(vec![5.0, 1.0]),
                None,
                None,
                Some(vec![6.0, 1.0]),
                None
            ]
        );
        assert_eq!(out.failed_batches, 0);
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["alpha".to_string(), "gamma!".to_string()]);
    }

    #[tokio::test]
    async fn a_failed_batch_only_nulls_its_own_slots() {
        let provider = Arc::new(RecordingProvider::new(Some(2)));
        let batcher = EmbeddingBatcher::new(provider.clone());

        let texts = ["a", "b", "boom", "d", "e"];
        let out = batcher.embed(&texts, 2).await;

        assert_eq!(out.failed_batches, 1);
        assert!(out.vectors[0].is_some());
        assert!(out.vectors[1].is_some());
        assert!(out.vectors[2].is_none());
        assert!(out.vectors[3].is_none());
        assert!(out.vectors[4].is_some());
        assert_eq!(provider.calls.lock().unwrap().len(), 3);
        assert_eq!(out.into_stored()[2], Vec::<f64>::new());
    }

    #[tokio::test]
    async fn wrong_dimension_counts_as_failure() {
        let batcher = EmbeddingBatcher::new(Arc::new(RecordingProvider::new(Some(768))));
        let out = batcher.embed(&["text"], 5).await;
        assert_eq!(out.vectors, vec![None]);
        assert_eq!(out.failed_batches, 1);
    }

    #[tokio::test]
    async fn zero_batch_size_is_clamped() {
        let provider = Arc::new(RecordingProvider::new(None));
        let batcher = EmbeddingBatcher::new(provider.clone());
        let out = batcher.embed(&["x", "y"], 0).await;
        assert_eq!(out.vectors.len(), 2);
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn embed_one_rejects_blank_text() {
        let batcher = EmbeddingBatcher::new(Arc::new(RecordingProvider::new(None)));
        assert!(matches!(
            batcher.embed_one("   ").await,
            Err(StorageError::InvalidArg(_))
        ));
        assert_eq!(batcher.embed_one("hey").await.unwrap(), vec![3.0, 1.0]);
    }

    #[test]
    fn disabled_backend_builds_null_provider() {
        let provider = build_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dimension(), None);
    }

    #[test]
    fn openai_backend_needs_a_key() {
        let config = EmbeddingConfig {
            backend: EmbeddingBackend::OpenAi,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(build_provider(&config), Err(StorageError::Config(_))));
    }
}
