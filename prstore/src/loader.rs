use crate::errors::Result;
use crate::models::{PullRequest, RecordKind};
use crate::rows::{rows_for_kind, RecordVectors};
use crate::warehouse::Warehouse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    StagingLoad,
    Reconciliation,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStage::StagingLoad => f.write_str("staging load"),
            LoadStage::Reconciliation => f.write_str("reconciliation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindOutcome {
    Committed {
        staged: usize,
        inserted: usize,
        updated: usize,
    },
    Failed {
        stage: LoadStage,
        error: String,
    },
}

impl KindOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, KindOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub load_id: String,
    pub repository: String,
    pub outcomes: BTreeMap<RecordKind, KindOutcome>,
}

impl LoadReport {
    pub fn outcome(&self, kind: RecordKind) -> Option<&KindOutcome> {
        self.outcomes.get(&kind)
    }

    pub fn status(&self) -> LoadStatus {
        let committed = self.outcomes.values().filter(|o| o.is_committed()).count();
        if committed == self.outcomes.len() {
            LoadStatus::Success
        } else if committed == 0 {
            LoadStatus::Failed
        } else {
            LoadStatus::Partial
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (RecordKind, LoadStage, &str)> {
        self.outcomes.iter().filter_map(|(kind, outcome)| match outcome {
            KindOutcome::Failed { stage, error } => Some((*kind, *stage, error.as_str())),
            KindOutcome::Committed { .. } => None,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let kinds: serde_json::Map<String, serde_json::Value> = self
            .outcomes
            .iter()
            .map(|(kind, outcome)| {
                let value = match outcome {
                    KindOutcome::Committed { staged, inserted, updated } => serde_json::json!({
                        "status": "committed",
                        "staged": staged,
                        "inserted": inserted,
                        "updated": updated,
                    }),
                    KindOutcome::Failed { stage, error } => serde_json::json!({
                        "status": "failed",
                        "stage": stage.to_string(),
                        "error": error,
                    }),
                };
                (kind.to_string(), value)
            })
            .collect();
        serde_json::json!({
            "load_id": self.load_id,
            "repository": self.repository,
            "kinds": kinds,
        })
    }
}

/// Writes records through staging into production so that any number of
/// re-runs over the same data converge on one row per natural key.
pub struct IdempotentUpsertLoader {
    warehouse: Arc<dyn Warehouse>,
}

impl IdempotentUpsertLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Loads every kind in order. A failing kind is reported and skipped;
    /// kinds already committed stay committed and later kinds still run.
    pub fn load(
        &self,
        repository: &str,
        records: &[PullRequest],
        vectors: &RecordVectors,
    ) -> LoadReport {
        let load_id = Uuid::new_v4().to_string();
        let mut outcomes = BTreeMap::new();

        for kind in RecordKind::ALL {
            let outcome = self.load_kind(kind, repository, &load_id, records, vectors);
            match &outcome {
                KindOutcome::Committed { staged, inserted, updated } => log::info!(
                    "Loaded {} rows for {} ({}): {} inserted, {} updated",
                    staged,
                    kind,
                    repository,
                    inserted,
                    updated
                ),
                KindOutcome::Failed { stage, error } => log::error!(
                    "Loading {} rows for {} failed during {}: {}",
                    kind,
                    repository,
                    stage,
                    error
                ),
            }
            outcomes.insert(kind, outcome);
        }

        LoadReport {
            load_id,
            repository: repository.to_string(),
            outcomes,
        }
    }

    fn load_kind(
        &self,
        kind: RecordKind,
        repository: &str,
        load_id: &str,
        records: &[PullRequest],
        vectors: &RecordVectors,
    ) -> KindOutcome {
        let rows = rows_for_kind(kind, records, vectors);
        if rows.is_empty() {
            return KindOutcome::Committed {
                staged: 0,
                inserted: 0,
                updated: 0,
            };
        }

        let staged = match self.warehouse.append_staging(kind, load_id, &rows) {
            Ok(staged) => staged,
            Err(err) => {
                return KindOutcome::Failed {
                    stage: LoadStage::StagingLoad,
                    error: err.to_string(),
                }
            }
        };

        match self.warehouse.reconcile(kind, repository) {
            Ok(stats) => KindOutcome::Committed {
                staged,
                inserted: stats.inserted,
                updated: stats.updated,
            },
            Err(err) => KindOutcome::Failed {
                stage: LoadStage::Reconciliation,
                error: err.to_string(),
            },
        }
    }

    /// Production row count per kind, for post-load verification.
    pub fn row_counts(&self) -> Result<BTreeMap<RecordKind, i64>> {
        RecordKind::ALL
            .into_iter()
            .map(|kind| Ok((kind, self.warehouse.row_count(kind)?)))
            .collect()
    }
}
