use crate::errors::{Result, StorageError};
use crate::models::RecordKind;
use crate::rows::{format_timestamp, Row};
use crate::schema::{ColumnType, TableSchema, OBSERVED_AT};
use chrono::{Duration, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Outcome of reconciling one kind's staging rows into production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Distinct natural keys present in staging for the repository.
    pub winners: usize,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table: &'static str,
    pub staging_table: &'static str,
    pub rows: i64,
    pub staging_rows: i64,
    pub staging_retention: Duration,
}

/// Append-then-reconcile storage for the four record kinds.
///
/// `append_staging` and `reconcile` each run in their own transaction, so a
/// failure leaves production untouched for that kind.
pub trait Warehouse: Send + Sync {
    fn ensure_tables(&self) -> Result<()>;

    /// Appends `rows` to the staging table tagged with `load_id`, purging
    /// staging rows past retention first. Returns the number appended.
    fn append_staging(&self, kind: RecordKind, load_id: &str, rows: &[Row]) -> Result<usize>;

    /// Merges the newest staged row per natural key for `repository` into
    /// production. Never replaces a production row with an older observation.
    fn reconcile(&self, kind: RecordKind, repository: &str) -> Result<ReconcileStats>;

    fn row_count(&self, kind: RecordKind) -> Result<i64>;

    /// Production rows for `repository` ordered by natural key.
    fn select_rows(&self, kind: RecordKind, repository: &str) -> Result<Vec<Map<String, Value>>>;

    fn set_retention(&self, kind: RecordKind, retention: Duration) -> Result<()>;

    fn table_info(&self, kind: RecordKind) -> Result<TableInfo>;
}

pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
    default_retention: Duration,
}

impl SqliteWarehouse {
    pub fn open(path: &Path, default_retention: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, default_retention)
    }

    pub fn in_memory(default_retention: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, default_retention)
    }

    fn with_connection(conn: Connection, default_retention: Duration) -> Result<Self> {
        let warehouse = Self {
            conn: Mutex::new(conn),
            default_retention,
        };
        warehouse.ensure_tables()?;
        Ok(warehouse)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Warehouse("warehouse connection mutex poisoned".into()))
    }

    fn retention(conn: &Connection, schema: &TableSchema, default: Duration) -> Result<Duration> {
        let seconds: Option<i64> = conn
            .query_row(
                "SELECT staging_retention_secs FROM table_options WHERE table_name = ?1",
                params![schema.table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seconds.map(Duration::seconds).unwrap_or(default))
    }

    fn merge_sql(schema: &TableSchema) -> String {
        let columns = schema.column_names().join(", ");
        let keys = schema.key_names().join(", ");
        let assignments = schema
            .mutable_columns()
            .map(|c| format!("{name} = excluded.{name}", name = c.name))
            .collect::<Vec<_>>()
            .join(",\n                ");
        format!(
            "INSERT INTO {table} ({columns})
             SELECT {columns} FROM (
                 SELECT {columns},
                        ROW_NUMBER() OVER (
                            PARTITION BY {keys}
                            ORDER BY {observed} DESC, staging_seq DESC
                        ) AS row_num
                 FROM {staging}
                 WHERE repository = ?1
             ) WHERE row_num = 1
             ON CONFLICT({keys}) DO UPDATE SET
                {assignments}
             WHERE excluded.{observed} >= {table}.{observed}",
            table = schema.table,
            staging = schema.staging_table,
            observed = OBSERVED_AT,
        )
    }

    /// Counts winners, and of those how many are new keys.
    fn preview_sql(schema: &TableSchema) -> String {
        let keys = schema.key_names().join(", ");
        let join = schema
            .key_names()
            .iter()
            .map(|k| format!("p.{k} = w.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN p.{first} IS NULL THEN 1 ELSE 0 END), 0)
             FROM (
                 SELECT {keys} FROM (
                     SELECT {keys},
                            ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY staging_seq) AS row_num
                     FROM {staging}
                     WHERE repository = ?1
                 ) WHERE row_num = 1
             ) w
             LEFT JOIN {table} p ON {join}",
            first = schema.key_names()[0],
            table = schema.table,
            staging = schema.staging_table,
        )
    }
}

impl Warehouse for SqliteWarehouse {
    fn ensure_tables(&self) -> Result<()> {
        let conn = self.lock()?;
        let mut ddl = String::from(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS table_options (
                table_name TEXT PRIMARY KEY,
                staging_retention_secs INTEGER NOT NULL
            );\n",
        );
        for kind in RecordKind::ALL {
            let schema = TableSchema::for_kind(kind);
            ddl.push_str(&schema.create_table_sql());
            ddl.push('\n');
            ddl.push_str(&schema.create_staging_sql());
            ddl.push('\n');
        }
        ddl.push_str("COMMIT;");
        conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn append_staging(&self, kind: RecordKind, load_id: &str, rows: &[Row]) -> Result<usize> {
        let schema = TableSchema::for_kind(kind);
        let mut conn = self.lock()?;
        let retention = Self::retention(&conn, schema, self.default_retention)?;
        let now = Utc::now();

        let tx = conn.transaction()?;
        let purged = tx.execute(
            &format!("DELETE FROM {} WHERE loaded_at < ?1", schema.staging_table),
            params![format_timestamp(&(now - retention))],
        )?;
        if purged > 0 {
            log::debug!("Purged {} expired rows from {}", purged, schema.staging_table);
        }

        let columns = schema.column_names();
        let placeholders = (1..=columns.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} (load_id, loaded_at, {}) VALUES ({})",
            schema.staging_table,
            columns.join(", "),
            placeholders
        );
        let loaded_at = format_timestamp(&now);
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                let mut values = Vec::with_capacity(columns.len() + 2);
                values.push(rusqlite::types::Value::Text(load_id.to_string()));
                values.push(rusqlite::types::Value::Text(loaded_at.clone()));
                for column in &columns {
                    values.push(row.value(schema, column).to_sql_value()?);
                }
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn reconcile(&self, kind: RecordKind, repository: &str) -> Result<ReconcileStats> {
        let schema = TableSchema::for_kind(kind);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (winners, inserted): (i64, i64) = tx.query_row(
            &Self::preview_sql(schema),
            params![repository],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let changed = tx.execute(&Self::merge_sql(schema), params![repository])?;
        tx.commit()?;

        let inserted = inserted as usize;
        Ok(ReconcileStats {
            winners: winners as usize,
            inserted,
            updated: changed.saturating_sub(inserted),
        })
    }

    fn row_count(&self, kind: RecordKind) -> Result<i64> {
        let schema = TableSchema::for_kind(kind);
        let conn = self.lock()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", schema.table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    fn select_rows(&self, kind: RecordKind, repository: &str) -> Result<Vec<Map<String, Value>>> {
        let schema = TableSchema::for_kind(kind);
        let conn = self.lock()?;
        let columns = schema.column_names();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE repository = ?1 ORDER BY {}",
            columns.join(", "),
            schema.table,
            schema.key_names().join(", ")
        ))?;
        let mut rows = stmt.query(params![repository])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Map::new();
            for (idx, column) in schema.columns.iter().enumerate() {
                let value = match row.get_ref(idx)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) if column.ty == ColumnType::Boolean => Value::Bool(v != 0),
                    ValueRef::Integer(v) => Value::from(v),
                    ValueRef::Real(v) => Value::from(v),
                    ValueRef::Text(bytes) => {
                        let text = String::from_utf8_lossy(bytes);
                        if column.ty == ColumnType::Vector {
                            serde_json::from_str(&text)?
                        } else {
                            Value::String(text.into_owned())
                        }
                    }
                    ValueRef::Blob(_) => {
                        return Err(StorageError::Warehouse(format!(
                            "unexpected blob in {}.{}",
                            schema.table, column.name
                        )))
                    }
                };
                map.insert(column.name.to_string(), value);
            }
            out.push(map);
        }
        Ok(out)
    }

    fn set_retention(&self, kind: RecordKind, retention: Duration) -> Result<()> {
        let schema = TableSchema::for_kind(kind);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO table_options (table_name, staging_retention_secs)
             VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET
                staging_retention_secs = excluded.staging_retention_secs",
            params![schema.table, retention.num_seconds()],
        )?;
        Ok(())
    }

    fn table_info(&self, kind: RecordKind) -> Result<TableInfo> {
        let schema = TableSchema::for_kind(kind);
        let conn = self.lock()?;
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };
        Ok(TableInfo {
            table: schema.table,
            staging_table: schema.staging_table,
            rows: count(schema.table)?,
            staging_rows: count(schema.staging_table)?,
            staging_retention: Self::retention(&conn, schema, self.default_retention)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Label, PrState, PullRequest};
    use crate::rows::{rows_for_kind, RecordVectors};
    use chrono::{DateTime, TimeZone};

    const REPO: &str = "octocat/hello-world";

    fn pr(number: u64, title: &str, observed_at: DateTime<Utc>) -> PullRequest {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        PullRequest {
            repository: REPO.into(),
            number,
            title: title.into(),
            body: None,
            state: PrState::Open,
            author: None,
            html_url: String::new(),
            created_at: at,
            updated_at: at,
            merged_at: None,
            closed_at: None,
            base_branch: "main".into(),
            head_branch: "topic".into(),
            labels: vec![],
            reviews: vec![],
            files: vec![],
            requested_reviewers: vec![],
            assignees: vec![],
            additions: 0,
            deletions: 0,
            changed_files: 0,
            draft: false,
            mergeable: None,
            observed_at,
        }
    }

    fn stage(warehouse: &SqliteWarehouse, kind: RecordKind, records: &[PullRequest]) {
        let rows = rows_for_kind(kind, records, &RecordVectors::default());
        warehouse.append_staging(kind, "load", &rows).unwrap();
    }

    fn titles(warehouse: &SqliteWarehouse) -> Vec<(i64, String)> {
        warehouse
            .select_rows(RecordKind::PullRequest, REPO)
            .unwrap()
            .into_iter()
            .map(|row| {
                (
                    row["number"].as_i64().unwrap(),
                    row["title"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn newest_observation_wins_within_one_batch() {
        let warehouse = SqliteWarehouse::in_memory(Duration::days(3)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::hours(1);
        stage(&warehouse, RecordKind::PullRequest, &[
            pr(1, "newer", t1),
            pr(1, "older", t0),
            pr(2, "only", t0),
        ]);

        let stats = warehouse.reconcile(RecordKind::PullRequest, REPO).unwrap();
        assert_eq!(stats, ReconcileStats { winners: 2, inserted: 2, updated: 0 });
        assert_eq!(titles(&warehouse), vec![(1, "newer".into()), (2, "only".into())]);
    }

    #[test]
    fn ties_go_to_the_last_appended_row() {
        let warehouse = SqliteWarehouse::in_memory(Duration::days(3)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        stage(&warehouse, RecordKind::PullRequest, &[pr(1, "first", t0), pr(1, "second", t0)]);
        warehouse.reconcile(RecordKind::PullRequest, REPO).unwrap();
        assert_eq!(titles(&warehouse), vec![(1, "second".into())]);
    }

    #[test]
    fn older_rerun_never_regresses_production() {
        let warehouse = SqliteWarehouse::in_memory(Duration::days(3)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::days(1);

        stage(&warehouse, RecordKind::PullRequest, &[pr(1, "fresh", t1)]);
        warehouse.reconcile(RecordKind::PullRequest, REPO).unwrap();

        // Staging expired; only the stale observation is left to merge.
        warehouse
            .lock()
            .unwrap()
            .execute("DELETE FROM staging_pull_requests", [])
            .unwrap();
        stage(&warehouse, RecordKind::PullRequest, &[pr(1, "stale", t0)]);
        let stats = warehouse.reconcile(RecordKind::PullRequest, REPO).unwrap();

        assert_eq!(stats, ReconcileStats { winners: 1, inserted: 0, updated: 0 });
        assert_eq!(titles(&warehouse), vec![(1, "fresh".into())]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let warehouse = SqliteWarehouse::in_memory(Duration::days(3)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut record = pr(3, "labels", t0);
        record.labels = vec![
            Label { name: "bug".into(), color: "f00".into(), description: None },
            Label { name: "ui".into(), color: "0f0".into(), description: Some("UI".into()) },
        ];

        for _ in 0..3 {
            stage(&warehouse, RecordKind::Label, std::slice::from_ref(&record));
            warehouse.reconcile(RecordKind::Label, REPO).unwrap();
        }

        assert_eq!(warehouse.row_count(RecordKind::Label).unwrap(), 2);
        let info = warehouse.table_info(RecordKind::Label).unwrap();
        assert_eq!(info.staging_rows, 6);
        assert_eq!(info.staging_retention, Duration::days(3));
    }

    #[test]
    fn expired_staging_rows_are_purged_on_append() {
        let warehouse = SqliteWarehouse::in_memory(Duration::days(3)).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        stage(&warehouse, RecordKind::PullRequest, &[pr(1, "a", t0)]);
        warehouse
            .lock()
            .unwrap()
            .execute(
                "UPDATE staging_pull_requests SET loaded_at = '2000-01-01T00:00:00.000000Z'",
                [],
            )
            .unwrap();

        warehouse.set_retention(RecordKind::PullRequest, Duration::hours(1)).unwrap();
        stage(&warehouse, RecordKind::PullRequest, &[pr(2, "b", t0)]);

        let info = warehouse.table_info(RecordKind::PullRequest).unwrap();
        assert_eq!(info.staging_rows, 1);
        assert_eq!(info.staging_retention, Duration::hours(1));
    }
}
