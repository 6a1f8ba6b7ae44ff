use crate::errors::Result;
use crate::models::PullRequest;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Bumped whenever the on-disk shape of a cached record changes. Older
/// snapshots are then treated as misses and re-fetched.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

const INDEX_FILE: &str = "index.json";

#[derive(Serialize, Deserialize)]
struct CachedSnapshot {
    schema_version: u32,
    cached_at: DateTime<Utc>,
    record: PullRequest,
}

#[derive(Serialize, Deserialize, Default)]
struct CacheIndex {
    /// Pull request number -> last write time.
    entries: BTreeMap<u64, DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
}

/// Read-through snapshot store for enriched pull requests, one JSON file per
/// record under `<root>/<owner>_<name>/pr_<number>.json`.
///
/// Unreadable entries behave as misses. Write failures are logged and
/// swallowed so the cache never fails an ingest.
pub struct LocalRecordCache {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl LocalRecordCache {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo.replace('/', "_"))
    }

    fn entry_path(&self, repo: &str, number: u64) -> PathBuf {
        self.repo_dir(repo).join(format!("pr_{number}.json"))
    }

    pub async fn has(&self, repo: &str, number: u64) -> bool {
        self.get(repo, number).await.is_some()
    }

    pub async fn get(&self, repo: &str, number: u64) -> Option<PullRequest> {
        let path = self.entry_path(repo, number);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("Cache entry {} is unreadable: {}", path.display(), err);
                return None;
            }
        };

        match serde_json::from_slice::<CachedSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.schema_version == SNAPSHOT_SCHEMA_VERSION => {
                Some(snapshot.record)
            }
            Ok(snapshot) => {
                log::warn!(
                    "Cache entry {} has schema version {} (expected {}); treating as miss",
                    path.display(),
                    snapshot.schema_version,
                    SNAPSHOT_SCHEMA_VERSION
                );
                None
            }
            Err(err) => {
                log::warn!("Cache entry {} is corrupt: {}", path.display(), err);
                None
            }
        }
    }

    /// Stores the snapshot and refreshes the repository index.
    pub async fn put(&self, repo: &str, record: &PullRequest) {
        if let Err(err) = self.try_put(repo, record).await {
            log::warn!(
                "Failed to cache {}#{}: {}",
                repo,
                record.number,
                err
            );
        }
    }

    async fn try_put(&self, repo: &str, record: &PullRequest) -> Result<()> {
        let dir = self.repo_dir(repo);
        tokio::fs::create_dir_all(&dir).await?;

        let now = Utc::now();
        let snapshot = CachedSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            cached_at: now,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.entry_path(repo, record.number), &bytes).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(repo).await;
        index.entries.insert(record.number, now);
        index.last_updated = Some(now);
        self.write_index(repo, &index).await
    }

    /// Cached pull request numbers for `repo`, ascending.
    pub async fn list_ids(&self, repo: &str) -> Vec<u64> {
        let index = self.read_index(repo).await;
        if !index.entries.is_empty() {
            return index.entries.keys().copied().collect();
        }
        // No usable index: fall back to the files on disk.
        let mut ids = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.repo_dir(repo)).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(number) = parse_entry_name(&entry.file_name().to_string_lossy()) {
                    ids.push(number);
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Removes entries last written more than `days` ago and returns how
    /// many were dropped.
    pub async fn evict_older_than(&self, repo: &str, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(repo).await;
        let mut removed = 0;

        for number in self.list_ids(repo).await {
            let path = self.entry_path(repo, number);
            let written_at = match index.entries.get(&number) {
                Some(at) => Some(*at),
                None => modified_at(&path).await,
            };
            let Some(written_at) = written_at else {
                continue;
            };
            if written_at < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                index.entries.remove(&number);
            }
        }

        if removed > 0 {
            log::info!("Evicted {} cached pull requests for {}", removed, repo);
            index.last_updated = Some(Utc::now());
            self.write_index(repo, &index).await?;
        }
        Ok(removed)
    }

    async fn read_index(&self, repo: &str) -> CacheIndex {
        let path = self.repo_dir(repo).join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                log::warn!("Cache index {} is corrupt: {}", path.display(), err);
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        }
    }

    async fn write_index(&self, repo: &str, index: &CacheIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.repo_dir(repo).join(INDEX_FILE), &bytes).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

fn parse_entry_name(name: &str) -> Option<u64> {
    name.strip_prefix("pr_")?.strip_suffix(".json")?.parse().ok()
}
