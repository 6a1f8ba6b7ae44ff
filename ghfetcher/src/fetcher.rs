use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use prstore::{
    cache::LocalRecordCache,
    errors::{Result as StorageResult, StorageError},
    fetch::{IngestWindow, PullRequestSource},
    models::{ApiBudget, PullRequest},
};
use tokio::sync::OnceCell;

use crate::{
    api::ApiClient,
    client::{ApiRequest, ReqwestTransport},
    error::{FetchError, Result},
    models::{ApiFile, ApiPullRequest, ApiRepository, ApiReview},
    params::{coordinates, FetcherConfig},
};

/// A pull request after enrichment. `complete` is false when the files or
/// reviews could not be fetched and the record carries fewer children than
/// upstream has.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub record: PullRequest,
    pub complete: bool,
}

/// Reads pull requests for one repository, enriching each with its files
/// and reviews and going through the snapshot cache when one is attached.
pub struct GitFetcher {
    api: Arc<ApiClient>,
    cache: Option<Arc<LocalRecordCache>>,
    repository: String,
    is_public: OnceCell<bool>,
}

impl GitFetcher {
    pub fn new(
        repository: &str,
        api: Arc<ApiClient>,
        cache: Option<Arc<LocalRecordCache>>,
    ) -> Result<Self> {
        let (owner, name) = coordinates(repository)?;
        Ok(Self {
            api,
            cache,
            repository: format!("{owner}/{name}"),
            is_public: OnceCell::new(),
        })
    }

    pub fn with_default_client(
        repository: &str,
        config: FetcherConfig,
        cache: Option<Arc<LocalRecordCache>>,
    ) -> StorageResult<Self> {
        let transport = ReqwestTransport::new(&config.api_base_url, config.token.clone())
            .map_err(|err| {
                StorageError::Initialization(format!("failed to create GitHub client: {err}"))
            })?;
        let api = Arc::new(ApiClient::new(Arc::new(transport), config));
        Ok(Self::new(repository, api, cache)?)
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn repo_path(&self, suffix: &str) -> String {
        format!("/repos/{}{}", self.repository, suffix)
    }

    /// Whether the repository is public. Resolved once; a failed lookup is
    /// retried on the next call.
    pub async fn is_public_repository(&self) -> Result<bool> {
        self.is_public
            .get_or_try_init(|| async {
                let request =
                    ApiRequest::new(self.repo_path(""), self.api.config().standard_timeout());
                let repo: ApiRepository = self.api.get_json(&request).await?;
                Ok::<_, FetchError>(!repo.private)
            })
            .await
            .copied()
    }

    /// Listings and file diffs on public repositories get the long timeout.
    /// A failed visibility lookup falls back to the standard timeout, except
    /// for rate limiting, which is returned to the caller.
    async fn timeout_for(&self, path: &str) -> Result<Duration> {
        let config = self.api.config();
        let diff_heavy = path.ends_with("/pulls") || path.ends_with("/files");
        if !diff_heavy {
            return Ok(config.standard_timeout());
        }
        match self.is_public_repository().await {
            Ok(true) => Ok(config.diff_timeout()),
            Ok(false) => Ok(config.standard_timeout()),
            Err(err) if err.is_rate_limited() => Err(err),
            Err(err) => {
                log::warn!(
                    "Could not resolve visibility of {}, using standard timeout: {}",
                    self.repository,
                    err
                );
                Ok(config.standard_timeout())
            }
        }
    }

    async fn list_request(&self, state: &str) -> Result<ApiRequest> {
        let path = self.repo_path("/pulls");
        let timeout = self.timeout_for(&path).await?;
        Ok(ApiRequest::new(path, timeout)
            .param("state", state)
            .param("sort", "updated")
            .param("direction", "desc"))
    }

    /// Pull requests merged inside `window`, newest update first.
    pub async fn fetch_merged(&self, window: &IngestWindow) -> Result<Vec<PullRequest>> {
        log::info!(
            "Fetching merged pull requests for {} from {} to {}",
            self.repository,
            window.since,
            window.until
        );
        let request = self
            .list_request("closed")
            .await?
            .param("since", window.since.format("%Y-%m-%dT%H:%M:%SZ"));

        // Sorted by update time, so nothing after an item updated before the
        // window start can have been merged inside it.
        let since = window.since;
        let listed: Vec<ApiPullRequest> = self
            .api
            .get_pages_until(request, self.api.config().per_page, |page: &[ApiPullRequest]| {
                page.last().is_some_and(|pr| pr.updated_at < since)
            })
            .await?;
        let observed_at = Utc::now();

        let candidates: Vec<ApiPullRequest> = listed
            .into_iter()
            .filter(|pr| pr.merged_at.is_some_and(|at| window.contains(at)))
            .collect();

        let merged = self.resolve_all(candidates, observed_at).await?;
        log::info!("Found {} merged pull requests in {}", merged.len(), self.repository);
        Ok(merged)
    }

    /// Up to `limit` open pull requests, most recently updated first.
    pub async fn fetch_open(&self, limit: usize) -> Result<Vec<PullRequest>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        log::info!("Fetching up to {} open pull requests for {}", limit, self.repository);

        let request = self.list_request("open").await?;
        let mut seen = 0usize;
        let mut listed: Vec<ApiPullRequest> = self
            .api
            .get_pages_until(request, limit.min(100), |page: &[ApiPullRequest]| {
                seen += page.len();
                seen >= limit
            })
            .await?;
        listed.truncate(limit);
        let observed_at = Utc::now();

        let open = self.resolve_all(listed, observed_at).await?;
        log::info!("Found {} open pull requests in {}", open.len(), self.repository);
        Ok(open)
    }

    /// Open pull requests that have `login` among their requested reviewers.
    pub async fn fetch_review_requests(&self, login: &str, limit: usize) -> Result<Vec<PullRequest>> {
        let open = self.fetch_open(limit).await?;
        Ok(open.into_iter().filter(|pr| pr.is_waiting_for(login)).collect())
    }

    async fn resolve_all(
        &self,
        items: Vec<ApiPullRequest>,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<PullRequest>> {
        let concurrency = self.api.config().enrich_concurrency.max(1);
        futures::stream::iter(items)
            .map(|item| self.resolve(item, observed_at))
            .buffered(concurrency)
            .try_collect()
            .await
    }

    /// Terminal cache hits are returned as stored. Everything else is
    /// enriched from the listing and, when complete, written back.
    async fn resolve(&self, item: ApiPullRequest, observed_at: DateTime<Utc>) -> Result<PullRequest> {
        let number = item.number;
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&self.repository, number).await {
                if cached.is_terminal() {
                    log::debug!("Using cached snapshot of {}#{}", self.repository, number);
                    return Ok(cached);
                }
            }
        }

        let record = item.into_record(&self.repository, observed_at);
        let Enrichment { record, complete } = self.enrich(record).await?;

        match (&self.cache, complete) {
            (Some(cache), true) => cache.put(&self.repository, &record).await,
            (Some(_), false) => log::warn!(
                "Not caching {}#{}: enrichment was incomplete",
                self.repository,
                number
            ),
            (None, _) => {}
        }
        Ok(record)
    }

    /// Replaces the record's files and reviews with freshly fetched ones.
    ///
    /// A failure on either child list is logged and leaves that list empty.
    /// Rate limiting is the exception and aborts with an error.
    pub async fn enrich(&self, mut pr: PullRequest) -> Result<Enrichment> {
        let mut complete = true;

        let files_path = self.repo_path(&format!("/pulls/{}/files", pr.number));
        let files_request = ApiRequest::new(files_path.clone(), self.timeout_for(&files_path).await?);
        match self.api.get_all_pages::<ApiFile>(files_request).await {
            Ok(files) => pr.files = files.into_iter().map(Into::into).collect(),
            Err(err) if err.is_rate_limited() => return Err(err),
            Err(err) => {
                log::warn!("Could not fetch files for {}#{}: {}", self.repository, pr.number, err);
                pr.files.clear();
                complete = false;
            }
        }

        let reviews_path = self.repo_path(&format!("/pulls/{}/reviews", pr.number));
        let reviews_request =
            ApiRequest::new(reviews_path.clone(), self.timeout_for(&reviews_path).await?);
        match self.api.get_all_pages::<ApiReview>(reviews_request).await {
            Ok(reviews) => pr.reviews = reviews.into_iter().map(Into::into).collect(),
            Err(err) if err.is_rate_limited() => return Err(err),
            Err(err) => {
                log::warn!("Could not fetch reviews for {}#{}: {}", self.repository, pr.number, err);
                pr.reviews.clear();
                complete = false;
            }
        }

        pr.fill_size_from_files();
        Ok(Enrichment { record: pr, complete })
    }
}

#[async_trait]
impl PullRequestSource for GitFetcher {
    fn name(&self) -> &'static str {
        "github"
    }

    fn repository(&self) -> &str {
        &self.repository
    }

    async fn fetch_merged(&self, window: &IngestWindow) -> StorageResult<Vec<PullRequest>> {
        Ok(GitFetcher::fetch_merged(self, window).await?)
    }

    async fn fetch_open(&self, limit: usize) -> StorageResult<Vec<PullRequest>> {
        Ok(GitFetcher::fetch_open(self, limit).await?)
    }

    async fn budget(&self) -> Option<ApiBudget> {
        self.api.budget().await
    }
}
