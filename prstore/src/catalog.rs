use crate::config::StorageConfig;
use crate::errors::{Result, StorageError};
use crate::models::{ApiBudget, IngestWatermark, TaskLog, TaskStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.catalog_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Initialization("catalog connection mutex poisoned".into()))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS api_budget (
                api_endpoint TEXT PRIMARY KEY,
                requests_left INTEGER NOT NULL,
                reset_time INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_logs (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT,
                details TEXT
            );
            CREATE TABLE IF NOT EXISTS ingest_watermarks (
                repository TEXT PRIMARY KEY,
                window_end INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn get_api_budget(&self, endpoint: &str) -> Result<Option<ApiBudget>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT api_endpoint, requests_left, reset_time FROM api_budget WHERE api_endpoint = ?1",
        )?;
        let mut rows = stmt.query(params![endpoint])?;

        if let Some(row) = rows.next()? {
            Ok(Some(ApiBudget {
                api_endpoint: row.get(0)?,
                requests_left: row.get(1)?,
                reset_time: row.get(2)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn upsert_api_budget(&self, budget: &ApiBudget) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO api_budget (api_endpoint, requests_left, reset_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(api_endpoint) DO UPDATE SET
                requests_left = excluded.requests_left,
                reset_time = excluded.reset_time",
            params![budget.api_endpoint, budget.requests_left, budget.reset_time],
        )?;
        Ok(())
    }

    pub fn create_task_log(&self, task_name: &str) -> Result<i64> {
        let conn = self.lock()?;
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO task_logs (task_name, start_time, status) VALUES (?1, ?2, ?3)",
            params![task_name, start_time, TaskStatus::Running.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_task_log_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE task_logs SET status = ?1, details = ?2, end_time = ?3 WHERE task_id = ?4",
            params![status.as_str(), details, end_time, task_id],
        )?;
        Ok(())
    }

    pub fn get_task_log(&self, task_id: i64) -> Result<Option<TaskLog>> {
        let conn = self.lock()?;
        let log = conn
            .query_row(
                "SELECT task_id, task_name, start_time, end_time, status, details
                 FROM task_logs WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(TaskLog {
                        task_id: row.get(0)?,
                        task_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        status: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        details: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(log)
    }

    pub fn get_watermark(&self, repository: &str) -> Result<Option<IngestWatermark>> {
        let conn = self.lock()?;
        let watermark = conn
            .query_row(
                "SELECT repository, window_end, updated_at FROM ingest_watermarks WHERE repository = ?1",
                params![repository],
                |row| {
                    Ok(IngestWatermark {
                        repository: row.get(0)?,
                        window_end: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(watermark)
    }

    /// Moves the watermark forward; an older window never rewinds it.
    pub fn advance_watermark(&self, repository: &str, window_end: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ingest_watermarks (repository, window_end, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(repository) DO UPDATE SET
                window_end = MAX(ingest_watermarks.window_end, excluded.window_end),
                updated_at = excluded.updated_at",
            params![repository, window_end, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}
