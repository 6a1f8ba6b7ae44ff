pub mod cache;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod errors;
pub mod fetch;
pub mod loader;
pub mod models;
pub mod rows;
pub mod schema;
pub mod sync;
pub mod warehouse;

use crate::cache::LocalRecordCache;
use crate::catalog::Catalog;
use crate::config::{EmbeddingConfig, LoaderConfig, StorageConfig};
use crate::embedding::{build_provider, EmbeddingBatcher};
use crate::errors::Result;
use crate::loader::IdempotentUpsertLoader;
use crate::sync::IngestSynchronizer;
use crate::warehouse::{SqliteWarehouse, Warehouse};
use std::sync::Arc;

/// The main entry point for the `prstore` library.
///
/// `PrStore` wires together everything an ingestion pass needs:
/// - A snapshot cache (`LocalRecordCache`) for enriched pull requests.
/// - A metadata database (`Catalog`) tracking run logs, API budgets and watermarks.
/// - A SQLite warehouse with staging and production tables per record kind.
/// - An embedding batcher over the configured provider.
/// - The `IngestSynchronizer` that runs fetch, embed and load.
///
/// # Example
///
/// ```rust,no_run
/// use prstore::{PrStore, config::StorageConfig};
/// use tempfile::tempdir;
///
/// #[tokio::main]
/// async fn main() {
///     let dir = tempdir().unwrap();
///     let config = StorageConfig::new(dir.path());
///     let storage = PrStore::new(config).await.unwrap();
///
///     // Hand `storage.cache` to a fetcher, then call `storage.synchronizer.ingest(..)`.
/// }
/// ```
pub struct PrStore {
    pub config: StorageConfig,
    pub catalog: Arc<Catalog>,
    pub cache: Arc<LocalRecordCache>,
    pub warehouse: Arc<dyn Warehouse>,
    pub batcher: Arc<EmbeddingBatcher>,
    pub loader: Arc<IdempotentUpsertLoader>,
    pub synchronizer: Arc<IngestSynchronizer>,
}

impl PrStore {
    /// Opens storage under `config` with embeddings disabled and default
    /// staging retention.
    pub async fn new(config: StorageConfig) -> Result<Self> {
        Self::with_options(config, &EmbeddingConfig::default(), &LoaderConfig::default()).await
    }

    /// Creates the cache directory, opens and migrates the catalog and
    /// warehouse, and builds the embedding provider named in `embedding`.
    pub async fn with_options(
        config: StorageConfig,
        embedding: &EmbeddingConfig,
        loader: &LoaderConfig,
    ) -> Result<Self> {
        let cache = Arc::new(LocalRecordCache::new(&config.cache_path).await?);

        let catalog = Arc::new(Catalog::new(&config)?);
        catalog.initialize_schema()?;

        let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::open(
            &config.warehouse_path,
            loader.staging_retention(),
        )?);

        let batcher = Arc::new(EmbeddingBatcher::new(build_provider(embedding)?));
        let loader = Arc::new(IdempotentUpsertLoader::new(Arc::clone(&warehouse)));
        let synchronizer = Arc::new(IngestSynchronizer::new(
            Arc::clone(&catalog),
            Arc::clone(&batcher),
            Arc::clone(&loader),
        ));

        Ok(Self {
            config,
            catalog,
            cache,
            warehouse,
            batcher,
            loader,
            synchronizer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prstore_initialization() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        let storage = PrStore::new(config.clone()).await;
        assert!(storage.is_ok());
        let storage = storage.unwrap();

        assert!(config.cache_path.exists());
        assert!(config.catalog_path.exists());
        assert!(config.warehouse_path.exists());
        for kind in RecordKind::ALL {
            assert_eq!(storage.warehouse.row_count(kind).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path());
        drop(PrStore::new(config.clone()).await.unwrap());
        assert!(PrStore::new(config).await.is_ok());
    }
}
