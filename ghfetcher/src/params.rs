use serde::Deserialize;
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Knobs for talking to the GitHub REST API.
#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_standard_timeout_secs")]
    pub standard_timeout_secs: u64,
    /// Applied to pull request listings and file diffs on public repositories.
    #[serde(default = "default_diff_timeout_secs")]
    pub diff_timeout_secs: u64,
    #[serde(default = "default_enrich_concurrency")]
    pub enrich_concurrency: usize,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_per_page() -> usize {
    100
}

fn default_max_pages() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_standard_timeout_secs() -> u64 {
    30
}

fn default_diff_timeout_secs() -> u64 {
    90
}

fn default_enrich_concurrency() -> usize {
    1
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base_url: default_api_base_url(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            max_retries: default_max_retries(),
            standard_timeout_secs: default_standard_timeout_secs(),
            diff_timeout_secs: default_diff_timeout_secs(),
            enrich_concurrency: default_enrich_concurrency(),
        }
    }
}

impl FetcherConfig {
    pub fn standard_timeout(&self) -> Duration {
        Duration::from_secs(self.standard_timeout_secs)
    }

    pub fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_secs)
    }
}

/// Splits `owner/name`.
pub fn coordinates(repo: &str) -> Result<(String, String)> {
    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(FetchError::InvalidParam(format!(
            "repo must be <owner>/<name>, got '{}'",
            repo
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_need_exactly_two_parts() {
        assert_eq!(
            coordinates("octocat/hello-world").unwrap(),
            ("octocat".to_string(), "hello-world".to_string())
        );
        assert!(coordinates("octocat").is_err());
        assert!(coordinates("a/b/c").is_err());
        assert!(coordinates("/b").is_err());
    }

    #[test]
    fn defaults_match_github_limits() {
        let config: FetcherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.per_page, 100);
        assert_eq!(config.max_pages, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.diff_timeout(), Duration::from_secs(90));
    }
}
