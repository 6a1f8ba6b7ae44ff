use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prstore::models::ApiBudget;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{ApiRequest, ApiResponse, GitHubTransport};
use crate::error::{FetchError, Result};
use crate::params::FetcherConfig;
use crate::rate_limit::RateGate;

/// Seconds to wait after failed attempt `attempt` (zero-based): 2, 3, 5, 9, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.min(10)) + 1)
}

enum Failure {
    Retry(String),
    Fatal(FetchError),
}

/// GitHub REST client: rate gate, retries with backoff, error
/// classification and pagination on top of a [`GitHubTransport`].
pub struct ApiClient {
    transport: Arc<dyn GitHubTransport>,
    gate: RateGate,
    config: FetcherConfig,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn GitHubTransport>, config: FetcherConfig) -> Self {
        Self {
            transport,
            gate: RateGate::new(),
            config,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub async fn budget(&self) -> Option<ApiBudget> {
        self.gate.snapshot().await.map(|snapshot| ApiBudget {
            api_endpoint: "github".to_string(),
            requests_left: snapshot.remaining,
            reset_time: snapshot.reset_at,
        })
    }

    /// One request, retried on transient failures. Returns the decoded body
    /// and the `Link` header's verdict on a next page.
    pub async fn get(&self, request: &ApiRequest) -> Result<(Value, Option<bool>)> {
        let max_retries = self.config.max_retries;
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            self.gate.acquire().await;

            let outcome = match self.transport.send(request).await {
                Ok(response) => {
                    self.gate
                        .observe(response.rate_remaining, response.rate_reset)
                        .await;
                    classify(request, response)
                }
                Err(FetchError::Client(message)) => Err(Failure::Retry(message)),
                Err(other) => Err(Failure::Fatal(other)),
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(Failure::Fatal(err)) => return Err(err),
                Err(Failure::Retry(message)) => last_error = message,
            }

            if attempt < max_retries {
                let wait = backoff_delay(attempt);
                log::warn!(
                    "Request to {} failed (attempt {}/{}), retrying in {:?}: {}",
                    request.path,
                    attempt + 1,
                    max_retries + 1,
                    wait,
                    last_error
                );
                tokio::time::sleep(wait).await;
            }
        }

        Err(FetchError::Transient {
            url: request.path.clone(),
            attempts: max_retries + 1,
            message: last_error,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let (value, _) = self.get(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetches every page of `request`.
    pub async fn get_all_pages<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<Vec<T>> {
        let per_page = self.config.per_page;
        self.get_pages_until(request, per_page, |_: &[T]| false).await
    }

    /// Fetches pages of `request` until none remain, the page ceiling is
    /// hit, or `stop` returns true for the page just read.
    ///
    /// "More pages" follows the `Link` header when the response has one and
    /// otherwise whether the page came back full. A non-array body is a
    /// single item.
    pub async fn get_pages_until<T, F>(
        &self,
        request: ApiRequest,
        per_page: usize,
        mut stop: F,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&[T]) -> bool,
    {
        let per_page = per_page.clamp(1, 100);
        let max_pages = self.config.max_pages.max(1);
        let mut items = Vec::new();

        for page in 1..=max_pages {
            let page_request = request
                .clone()
                .param("per_page", per_page)
                .param("page", page);
            let (value, has_next) = self.get(&page_request).await?;

            let page_items: Vec<T> = match value {
                Value::Array(values) => values
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<_, _>>()?,
                Value::Null => return Ok(items),
                single => {
                    items.push(serde_json::from_value(single)?);
                    return Ok(items);
                }
            };

            let received = page_items.len();
            let halt = stop(&page_items);
            items.extend(page_items);
            if halt {
                break;
            }

            let more = has_next.unwrap_or(received >= per_page);
            if !more {
                break;
            }
            if page == max_pages {
                log::warn!(
                    "Stopped paginating {} at page {} to avoid an unbounded crawl",
                    request.path,
                    page
                );
            }
        }

        Ok(items)
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn classify(
    request: &ApiRequest,
    response: ApiResponse,
) -> std::result::Result<(Value, Option<bool>), Failure> {
    let status = response.status;
    if (200..300).contains(&status) {
        if response.body.trim().is_empty() {
            return Ok((Value::Null, response.has_next));
        }
        return serde_json::from_str(&response.body)
            .map(|value| (value, response.has_next))
            .map_err(|e| Failure::Retry(format!("undecodable response body: {e}")));
    }

    let message = error_message(&response.body);
    if status == 403 || status == 429 {
        let exhausted = response.rate_remaining == Some(0);
        if message.to_lowercase().contains("rate limit") || exhausted || status == 429 {
            let reset_at = response
                .rate_reset
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
            return Err(Failure::Fatal(FetchError::RateLimited { reset_at }));
        }
    }
    if status == 404 {
        return Err(Failure::Fatal(FetchError::NotFound(request.path.clone())));
    }
    if status >= 500 {
        return Err(Failure::Retry(format!("server error {status}: {message}")));
    }
    Err(Failure::Fatal(FetchError::Http {
        status,
        url: request.path.clone(),
        message,
    }))
}
