//! Run store trait definition.
//!
//! A key-value contract over `RunRecord`s keyed by run id, with secondary
//! listing by workflow id and by status. Writes are whole-record upserts.

use std::future::Future;

use trellis_types::error::RepositoryError;
use trellis_types::workflow::{RunRecord, RunStatus};
use uuid::Uuid;

/// Persistence for workflow runs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Listings are ordered newest first (by `started_at`).
pub trait RunStore: Send + Sync + 'static {
    /// Insert or replace a run record.
    fn put_run(
        &self,
        record: &RunRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    fn list_runs_by_workflow(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// Every stored run, newest first.
    fn list_runs(
        &self,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// Delete a run. Returns `true` if it existed.
    fn delete_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}
