use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use prstore::{
    catalog::Catalog,
    config::StorageConfig,
    embedding::{EmbeddingBatcher, EmbeddingProvider},
    errors::{Result as StorageResult, StorageError},
    fetch::{IngestWindow, PullRequestSource},
    loader::IdempotentUpsertLoader,
    models::{ApiBudget, FileChange, Label, PrState, PullRequest, Review, ReviewState, User},
    sync::IngestSynchronizer,
    warehouse::{SqliteWarehouse, Warehouse},
};
use tempfile::TempDir;
use tokio::sync::Mutex;

pub const REPO: &str = "octocat/hello-world";

#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: StorageConfig,
    pub catalog: Arc<Catalog>,
    pub warehouse: Arc<SqliteWarehouse>,
    pub loader: Arc<IdempotentUpsertLoader>,
    pub synchronizer: IngestSynchronizer,
}

/// Two-dimensional vectors derived from the text length.
pub struct LengthEmbedding;

#[async_trait]
impl EmbeddingProvider for LengthEmbedding {
    async fn embed(&self, texts: Vec<String>) -> StorageResult<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|t| vec![t.len() as f64, 1.0]).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(2)
    }
}

pub async fn init_test_context() -> anyhow::Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let config = StorageConfig::new(temp_dir.path());

    let catalog = Arc::new(Catalog::new(&config)?);
    catalog.initialize_schema()?;

    let warehouse = Arc::new(SqliteWarehouse::open(
        &config.warehouse_path,
        chrono::Duration::days(3),
    )?);
    let loader = Arc::new(IdempotentUpsertLoader::new(
        Arc::clone(&warehouse) as Arc<dyn Warehouse>
    ));
    let batcher = Arc::new(EmbeddingBatcher::new(Arc::new(LengthEmbedding)));

    let synchronizer =
        IngestSynchronizer::new(Arc::clone(&catalog), batcher, Arc::clone(&loader));

    Ok(TestContext {
        temp_dir,
        config,
        catalog,
        warehouse,
        loader,
        synchronizer,
    })
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

pub fn window() -> IngestWindow {
    IngestWindow::new(at(1, 0), at(31, 0)).unwrap()
}

pub fn pull_request(number: u64, state: PrState, observed_at: DateTime<Utc>) -> PullRequest {
    let merged_at = (state == PrState::Merged).then(|| at(10, 0));
    PullRequest {
        repository: REPO.into(),
        number,
        title: format!("Change number {number}"),
        body: if number % 2 == 0 { Some("Some details".into()) } else { None },
        state,
        author: Some(User {
            login: "mona".into(),
            name: Some("Mona Lisa".into()),
            avatar_url: String::new(),
            html_url: "https://github.com/mona".into(),
        }),
        html_url: format!("https://github.com/{REPO}/pull/{number}"),
        created_at: at(2, 0),
        updated_at: at(10, 0),
        merged_at,
        closed_at: merged_at,
        base_branch: "main".into(),
        head_branch: format!("change-{number}"),
        labels: vec![Label {
            name: "area/core".into(),
            color: "ededed".into(),
            description: None,
        }],
        reviews: vec![Review {
            id: 10_000 + number as i64,
            user: None,
            state: ReviewState::Approved,
            body: Some("Looks good".into()),
            submitted_at: Some(at(9, 0)),
            html_url: String::new(),
        }],
        files: vec![FileChange {
            filename: format!("src/module_{number}.rs"),
            status: "modified".into(),
            additions: 3,
            deletions: 1,
            changes: 4,
            patch: Some("@@ -1,1 +1,3 @@".into()),
        }],
        requested_reviewers: vec![],
        assignees: vec![],
        additions: 3,
        deletions: 1,
        changed_files: 1,
        draft: false,
        mergeable: None,
        observed_at,
    }
}

/// Serves fixed lists; can be told to fail the merged listing.
pub struct StaticSource {
    pub merged: Mutex<Vec<PullRequest>>,
    pub open: Mutex<Vec<PullRequest>>,
    pub fail_merged: Mutex<Option<StorageError>>,
}

#[allow(dead_code)]
impl StaticSource {
    pub fn new(merged: Vec<PullRequest>, open: Vec<PullRequest>) -> Self {
        Self {
            merged: Mutex::new(merged),
            open: Mutex::new(open),
            fail_merged: Mutex::new(None),
        }
    }

    pub async fn set_merged(&self, records: Vec<PullRequest>) {
        *self.merged.lock().await = records;
    }

    pub async fn fail_next(&self, err: StorageError) {
        *self.fail_merged.lock().await = Some(err);
    }
}

#[async_trait]
impl PullRequestSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn repository(&self) -> &str {
        REPO
    }

    async fn fetch_merged(&self, _window: &IngestWindow) -> StorageResult<Vec<PullRequest>> {
        if let Some(err) = self.fail_merged.lock().await.take() {
            return Err(err);
        }
        Ok(self.merged.lock().await.clone())
    }

    async fn fetch_open(&self, limit: usize) -> StorageResult<Vec<PullRequest>> {
        let open = self.open.lock().await;
        Ok(open.iter().take(limit).cloned().collect())
    }

    async fn budget(&self) -> Option<ApiBudget> {
        Some(ApiBudget {
            api_endpoint: "static".into(),
            requests_left: 4321,
            reset_time: 1_717_000_000,
        })
    }
}
