//! libSQL backend: async `TaskStore` and `StatsSink` implementation.
//!
//! Supports local file and in-memory databases. Filter and modification
//! settings are stored as JSON documents in the record shape, so schema
//! changes to those settings don't need migrations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{StatsSink, TaskStats, TaskStore};
use crate::tasks::model::{Task, TaskRecord, TaskStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Query tasks and validate each row, skipping the ones that fail.
    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            };
            let record = row_to_record(&row)?;
            let label = record.label.clone();
            match Task::from_record(record) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(task = %label, error = %e, "Skipping invalid task row"),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, text: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(text)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

/// Map a libsql Row to a raw task record.
///
/// Column order matches TASK_COLUMNS:
/// 0:owner_id, 1:label, 2:status, 3:source_ids, 4:destination_ids,
/// 5:filters, 6:modifications, 7:delay_secs
fn row_to_record(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let owner_id: i64 = row.get(0).map_err(read)?;
    let label: String = row.get(1).map_err(read)?;
    let status: String = row.get(2).map_err(read)?;
    let sources: String = row.get(3).map_err(read)?;
    let destinations: String = row.get(4).map_err(read)?;
    let filters: String = row.get(5).map_err(read)?;
    let modifications: String = row.get(6).map_err(read)?;
    let delay_secs: i64 = row.get(7).map_err(read)?;

    Ok(TaskRecord {
        label,
        owner_id,
        status,
        source_ids: from_json("source_ids", &sources)?,
        destination_ids: from_json("destination_ids", &destinations)?,
        filters: from_json("filters", &filters)?,
        modifications: from_json("modifications", &modifications)?,
        delay_secs: delay_secs.max(0) as u64,
    })
}

// ── Trait implementations ───────────────────────────────────────────

const TASK_COLUMNS: &str =
    "owner_id, label, status, source_ids, destination_ids, filters, modifications, delay_secs";

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn active_tasks_for_source(&self, source_id: i64) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "active_tasks_for_source",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1"),
                params![TaskStatus::Active.as_str()],
            )
            .await?;

        Ok(tasks
            .into_iter()
            .filter(|t| t.is_active() && t.has_source(source_id))
            .collect())
    }

    async fn list_tasks_for_owner(&self, owner_id: i64) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_tasks_for_owner",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY label"),
            params![owner_id],
        )
        .await
    }

    async fn get_task(&self, owner_id: i64, label: &str) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 AND label = ?2"),
                params![owner_id, label],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let record = task.to_record();
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO tasks (owner_id, label, status, source_ids, destination_ids, filters, modifications, delay_secs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT (owner_id, label) DO UPDATE SET
                    status = ?3, source_ids = ?4, destination_ids = ?5,
                    filters = ?6, modifications = ?7, delay_secs = ?8, updated_at = ?9",
                params![
                    record.owner_id,
                    record.label.clone(),
                    record.status.clone(),
                    to_json(&record.source_ids)?,
                    to_json(&record.destination_ids)?,
                    to_json(&record.filters)?,
                    to_json(&record.modifications)?,
                    i64::try_from(record.delay_secs).unwrap_or(i64::MAX),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_task: {e}")))?;

        debug!(task = %task.label, owner = task.owner_id, "Task saved");
        Ok(())
    }

    async fn set_status(
        &self,
        owner_id: i64,
        label: &str,
        status: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE owner_id = ?3 AND label = ?4",
                params![status.as_str(), now, owner_id, label],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_status: {e}")))?;

        debug!(task = %label, status = %status, "Task status updated");
        Ok(count > 0)
    }

    async fn delete_task(&self, owner_id: i64, label: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE owner_id = ?1 AND label = ?2",
                params![owner_id, label],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(count > 0)
    }

    async fn get_stats(
        &self,
        owner_id: i64,
        label: &str,
    ) -> Result<Option<TaskStats>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT label, delivered, failed, updated_at FROM task_stats
                 WHERE owner_id = ?1 AND label = ?2",
                params![owner_id, label],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let read = |e: libsql::Error| DatabaseError::Query(format!("get_stats row parse: {e}"));
                let updated: String = row.get(3).map_err(read)?;
                Ok(Some(TaskStats {
                    owner_id,
                    label: row.get(0).map_err(read)?,
                    delivered: row.get::<i64>(1).map_err(read)?.max(0) as u64,
                    failed: row.get::<i64>(2).map_err(read)?.max(0) as u64,
                    updated_at: parse_datetime(&updated),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_stats: {e}"))),
        }
    }
}

#[async_trait]
impl StatsSink for LibSqlBackend {
    async fn record_stat(
        &self,
        owner_id: i64,
        label: &str,
        success: bool,
    ) -> Result<(), DatabaseError> {
        let (delivered, failed): (i64, i64) = if success { (1, 0) } else { (0, 1) };
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO task_stats (owner_id, label, delivered, failed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (owner_id, label) DO UPDATE SET
                    delivered = delivered + excluded.delivered,
                    failed = failed + excluded.failed,
                    updated_at = excluded.updated_at",
                params![owner_id, label, delivered, failed, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_stat: {e}")))?;
        Ok(())
    }
}
