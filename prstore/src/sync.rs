use crate::catalog::Catalog;
use crate::embedding::{EmbeddedTexts, EmbeddingBatcher};
use crate::errors::{Result, StorageError};
use crate::fetch::{IngestWindow, PullRequestSource};
use crate::loader::{IdempotentUpsertLoader, LoadReport, LoadStatus};
use crate::models::{PullRequest, TaskStatus};
use crate::rows::RecordVectors;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub include_merged: bool,
    /// Also ingest up to this many open pull requests.
    pub open_limit: Option<usize>,
    pub embedding_batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            include_merged: true,
            open_limit: None,
            embedding_batch_size: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub task_id: i64,
    pub repository: String,
    pub window: IngestWindow,
    pub fetched: usize,
    pub failed_embedding_batches: usize,
    pub load: LoadReport,
    pub status: TaskStatus,
}

/// Drives one ingestion pass: fetch, embed, load, then bookkeeping in the
/// catalog.
pub struct IngestSynchronizer {
    catalog: Arc<Catalog>,
    batcher: Arc<EmbeddingBatcher>,
    loader: Arc<IdempotentUpsertLoader>,
}

impl IngestSynchronizer {
    pub fn new(
        catalog: Arc<Catalog>,
        batcher: Arc<EmbeddingBatcher>,
        loader: Arc<IdempotentUpsertLoader>,
    ) -> Self {
        Self {
            catalog,
            batcher,
            loader,
        }
    }

    pub async fn ingest(
        &self,
        source: &dyn PullRequestSource,
        window: IngestWindow,
        options: &IngestOptions,
    ) -> Result<IngestReport> {
        let repository = source.repository().to_string();
        let task_name = format!("ingest_{}_with_{}", repository, source.name());
        let task_id = self.catalog.create_task_log(&task_name)?;

        let records = match self.fetch(source, &window, options).await {
            Ok(records) => records,
            Err(err) => {
                log::error!("Ingest of {} aborted while fetching: {}", repository, err);
                self.record_budget(source).await;
                let details = serde_json::json!({ "error": err.to_string() }).to_string();
                self.catalog
                    .update_task_log_status(task_id, TaskStatus::Failed, &details)?;
                return Err(err);
            }
        };
        log::info!("Fetched {} pull requests for {}", records.len(), repository);

        let (vectors, failed_embedding_batches) =
            self.embed(&records, options.embedding_batch_size).await;

        let fetched = records.len();
        let loader = Arc::clone(&self.loader);
        let repo = repository.clone();
        let load = tokio::task::spawn_blocking(move || loader.load(&repo, &records, &vectors))
            .await
            .map_err(|e| StorageError::SyncError(format!("load task failed: {}", e)))?;

        self.record_budget(source).await;

        let status = match load.status() {
            LoadStatus::Success => TaskStatus::Success,
            LoadStatus::Partial => TaskStatus::Partial,
            LoadStatus::Failed => TaskStatus::Failed,
        };
        let details = serde_json::json!({
            "fetched": fetched,
            "failed_embedding_batches": failed_embedding_batches,
            "load": load.to_json(),
        });
        self.catalog
            .update_task_log_status(task_id, status, &details.to_string())?;

        if status == TaskStatus::Success {
            self.catalog
                .advance_watermark(&repository, window.until.timestamp())?;
        }
        log::info!("Ingest of {} finished with status {}", repository, status.as_str());

        Ok(IngestReport {
            task_id,
            repository,
            window,
            fetched,
            failed_embedding_batches,
            load,
            status,
        })
    }

    async fn fetch(
        &self,
        source: &dyn PullRequestSource,
        window: &IngestWindow,
        options: &IngestOptions,
    ) -> Result<Vec<PullRequest>> {
        let mut records = Vec::new();
        if options.include_merged {
            records.extend(source.fetch_merged(window).await?);
        }
        if let Some(limit) = options.open_limit {
            records.extend(source.fetch_open(limit).await?);
        }
        Ok(dedup_by_number(records))
    }

    async fn embed(&self, records: &[PullRequest], batch_size: usize) -> (RecordVectors, usize) {
        let titles: Vec<&str> = records.iter().map(|pr| pr.title.as_str()).collect();
        let bodies: Vec<&str> = records
            .iter()
            .map(|pr| pr.body.as_deref().unwrap_or(""))
            .collect();
        let reviews: Vec<(i64, &str)> = records
            .iter()
            .flat_map(|pr| pr.reviews.iter())
            .map(|review| (review.id, review.body.as_deref().unwrap_or("")))
            .collect();
        let patches: Vec<((u64, String), &str)> = records
            .iter()
            .flat_map(|pr| {
                pr.files.iter().map(move |file| {
                    (
                        (pr.number, file.filename.clone()),
                        file.patch.as_deref().unwrap_or(""),
                    )
                })
            })
            .collect();

        let review_texts: Vec<&str> = reviews.iter().map(|(_, text)| *text).collect();
        let patch_texts: Vec<&str> = patches.iter().map(|(_, text)| *text).collect();

        let (title_vecs, body_vecs, review_vecs, patch_vecs) = tokio::join!(
            self.batcher.embed(&titles, batch_size),
            self.batcher.embed(&bodies, batch_size),
            self.batcher.embed(&review_texts, batch_size),
            self.batcher.embed(&patch_texts, batch_size),
        );
        let failed = title_vecs.failed_batches
            + body_vecs.failed_batches
            + review_vecs.failed_batches
            + patch_vecs.failed_batches;

        let numbers = records.iter().map(|pr| pr.number);
        let vectors = RecordVectors {
            titles: keyed(numbers.clone(), title_vecs),
            bodies: keyed(numbers, body_vecs),
            review_bodies: keyed(reviews.iter().map(|(id, _)| *id), review_vecs),
            patches: keyed(patches.into_iter().map(|(key, _)| key), patch_vecs),
        };
        (vectors, failed)
    }

    async fn record_budget(&self, source: &dyn PullRequestSource) {
        if let Some(budget) = source.budget().await {
            if let Err(err) = self.catalog.upsert_api_budget(&budget) {
                log::warn!("Failed to record API budget: {}", err);
            }
        }
    }
}

fn keyed<K: Eq + Hash>(keys: impl Iterator<Item = K>, embedded: EmbeddedTexts) -> HashMap<K, Vec<f64>> {
    keys.zip(embedded.vectors)
        .filter_map(|(key, vector)| vector.map(|v| (key, v)))
        .collect()
}

/// Keeps one record per number; the later occurrence replaces the earlier
/// one in place.
fn dedup_by_number(records: Vec<PullRequest>) -> Vec<PullRequest> {
    let mut positions: HashMap<u64, usize> = HashMap::new();
    let mut out: Vec<PullRequest> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.number) {
            Some(&idx) => out[idx] = record,
            None => {
                positions.insert(record.number, out.len());
                out.push(record);
            }
        }
    }
    out
}
