//! SQLite run store implementation.
//!
//! Implements `RunStore` from `trellis-core` using sqlx with split read/write
//! pools. The execution context snapshot and failure are stored as JSON text;
//! timestamps as RFC 3339.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use trellis_core::repository::run::RunStore;
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{Failure, RunRecord, RunStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

const SELECT_COLUMNS: &str = "SELECT run_id, workflow_id, status, context, suspended_step_path, error, started_at, updated_at, completed_at FROM workflow_runs";

/// SQLite-backed implementation of `RunStore`.
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    status: String,
    context: String,
    suspended_step_path: Option<String>,
    error: Option<String>,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            suspended_step_path: row.try_get("suspended_step_path")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<RunRecord, RepositoryError> {
        let run_id = parse_uuid(&self.run_id)?;
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;

        let context: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;

        let error: Option<Failure> = self
            .error
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid error JSON: {e}")))
            })
            .transpose()?;

        Ok(RunRecord {
            run_id,
            workflow_id: self.workflow_id,
            status,
            context,
            suspended_step_path: self.suspended_step_path,
            error,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

fn rows_to_records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<RunRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that `ORDER BY started_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite treats a negative LIMIT as "no limit".
fn limit_value(limit: Option<u32>) -> i64 {
    limit.map_or(-1, i64::from)
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn put_run(&self, record: &RunRecord) -> Result<(), RepositoryError> {
        let context = serde_json::to_string(&record.context)
            .map_err(|e| RepositoryError::Query(format!("serialize context: {e}")))?;
        let error = record
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize error: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_id, status, context, suspended_step_path, error,
                started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 context = excluded.context,
                 suspended_step_path = excluded.suspended_step_path,
                 error = excluded.error,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(record.status.as_str())
        .bind(&context)
        .bind(&record.suspended_step_path)
        .bind(&error)
        .bind(format_datetime(&record.started_at))
        .bind(format_datetime(&record.updated_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE run_id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs_by_workflow(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE workflow_id = ? ORDER BY started_at DESC, run_id DESC LIMIT ?"
        ))
        .bind(workflow_id)
        .bind(limit_value(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_records(&rows)
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = ? ORDER BY started_at DESC, run_id DESC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit_value(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_records(&rows)
    }

    async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} ORDER BY started_at DESC, run_id DESC LIMIT ?"
        ))
        .bind(limit_value(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_records(&rows)
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use trellis_types::workflow::ErrorKind;

    async fn test_store() -> (SqliteRunStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("runs.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteRunStore::new(pool), dir)
    }

    fn record(workflow_id: &str, status: RunStatus, minutes_ago: i64) -> RunRecord {
        let started = Utc::now() - Duration::minutes(minutes_ago);
        RunRecord {
            run_id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            status,
            context: json!({"steps": {"a": {"status": "success"}}}),
            suspended_step_path: None,
            error: None,
            started_at: started,
            updated_at: started,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let (store, _dir) = test_store().await;
        let mut run = record("article", RunStatus::Suspended, 0);
        run.suspended_step_path = Some("review.approve".to_string());
        store.put_run(&run).await.unwrap();

        let fetched = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow_id, "article");
        assert_eq!(fetched.status, RunStatus::Suspended);
        assert_eq!(fetched.suspended_step_path.as_deref(), Some("review.approve"));
        assert_eq!(fetched.context, run.context);
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_run() {
        let (store, _dir) = test_store().await;
        let mut run = record("article", RunStatus::Running, 0);
        store.put_run(&run).await.unwrap();

        run.status = RunStatus::Failed;
        run.error = Some(Failure::new(ErrorKind::Cancelled, "run was cancelled"));
        run.completed_at = Some(Utc::now());
        store.put_run(&run).await.unwrap();

        let fetched = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
        assert_eq!(fetched.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(fetched.completed_at.is_some());
        assert_eq!(store.list_runs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_run() {
        let (store, _dir) = test_store().await;
        assert!(store.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listings_newest_first_with_limit() {
        let (store, _dir) = test_store().await;
        let old = record("article", RunStatus::Completed, 30);
        let mid = record("article", RunStatus::Failed, 20);
        let new = record("approval", RunStatus::Completed, 10);
        for run in [&old, &mid, &new] {
            store.put_run(run).await.unwrap();
        }

        let all = store.list_runs(None).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![new.run_id, mid.run_id, old.run_id]);

        let article = store.list_runs_by_workflow("article", None).await.unwrap();
        assert_eq!(article.len(), 2);
        assert_eq!(article[0].run_id, mid.run_id);

        let completed = store
            .list_runs_by_status(RunStatus::Completed, Some(1))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].run_id, new.run_id);
    }

    #[tokio::test]
    async fn test_delete_run() {
        let (store, _dir) = test_store().await;
        let run = record("article", RunStatus::Completed, 0);
        store.put_run(&run).await.unwrap();

        assert!(store.delete_run(&run.run_id).await.unwrap());
        assert!(!store.delete_run(&run.run_id).await.unwrap());
        assert!(store.get_run(&run.run_id).await.unwrap().is_none());
    }
}
