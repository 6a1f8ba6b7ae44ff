use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, LINK, USER_AGENT};

use crate::error::{FetchError, Result};

pub const DEFAULT_USER_AGENT: &str = "prstore-ingest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Path below the API root, e.g. `/repos/octocat/hello-world/pulls`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            timeout,
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response with the headers the client cares about already extracted.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    pub rate_remaining: Option<i64>,
    /// Epoch seconds at which the rate window resets.
    pub rate_reset: Option<i64>,
    /// Whether another page follows. `None` when the transport cannot tell,
    /// in which case the client falls back to the page-size heuristic.
    pub has_next: Option<bool>,
    pub body: String,
}

/// Seam between the API client and the network. Connection-level failures
/// come back as [`FetchError::Client`].
#[async_trait]
pub trait GitHubTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| FetchError::InvalidParam(format!("invalid API url '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

pub fn link_has_next(link: &str) -> bool {
    link.split(',')
        .any(|part| part.split(';').skip(1).any(|attr| attr.trim() == "rel=\"next\""))
}

/// GitHub omits `Link` on a single-page result, so a successful response
/// without one is the last page.
pub fn next_page_hint(status: u16, link: Option<&str>) -> Option<bool> {
    match link {
        Some(link) => Some(link_has_next(link)),
        None if (200..300).contains(&status) => Some(false),
        None => None,
    }
}

#[async_trait]
impl GitHubTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .get(&url)
            .query(&request.query)
            .timeout(request.timeout)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, DEFAULT_USER_AGENT);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Client(e.to_string()))?;

        let headers = response.headers();
        let rate_remaining = header_i64(headers, "x-ratelimit-remaining");
        let rate_reset = header_i64(headers, "x-ratelimit-reset");
        let status = response.status().as_u16();
        let has_next = next_page_hint(
            status,
            headers.get(LINK).and_then(|value| value.to_str().ok()),
        );
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(ApiResponse {
            status,
            rate_remaining,
            rate_reset,
            has_next,
            body,
        })
    }
}
