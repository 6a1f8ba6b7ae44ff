use crate::errors::{Result, StorageError};
use crate::models::{ApiBudget, PullRequest};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Closed time range `[since, until]` selecting merged pull requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl IngestWindow {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Self> {
        if since > until {
            return Err(StorageError::InvalidArg(format!(
                "window start {} is after its end {}",
                since, until
            )));
        }
        Ok(Self { since, until })
    }

    /// The `days` days ending at `now`.
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        Self {
            since: now - Duration::days(days.max(0)),
            until: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since <= at && at <= self.until
    }
}

/// A source of enriched pull requests for one repository.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `owner/name` of the repository this source reads.
    fn repository(&self) -> &str;

    /// Pull requests merged inside `window`, enriched with their children.
    async fn fetch_merged(&self, window: &IngestWindow) -> Result<Vec<PullRequest>>;

    /// Up to `limit` open pull requests, enriched with their children.
    async fn fetch_open(&self, limit: usize) -> Result<Vec<PullRequest>>;

    /// Last request budget reported by the source, if it tracks one.
    async fn budget(&self) -> Option<ApiBudget> {
        None
    }
}
