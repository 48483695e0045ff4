//! Run store selection.
//!
//! `AnyRunStore` lets the binary pick a backend from configuration at
//! runtime while the engine stays generic over `RunStore`.

use std::path::{Path, PathBuf};

use trellis_core::repository::memory::InMemoryRunStore;
use trellis_core::repository::run::RunStore;
use trellis_types::config::{StoreBackend, StoreConfig};
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{RunRecord, RunStatus};
use uuid::Uuid;

use crate::filesystem::FileRunStore;
use crate::sqlite::pool::{database_url_for, DatabasePool};
use crate::sqlite::SqliteRunStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to open run store: {0}")]
    Repository(#[from] RepositoryError),
}

pub enum AnyRunStore {
    Sqlite(SqliteRunStore),
    File(FileRunStore),
    Memory(InMemoryRunStore),
}

impl AnyRunStore {
    pub fn backend(&self) -> StoreBackend {
        match self {
            AnyRunStore::Sqlite(_) => StoreBackend::Sqlite,
            AnyRunStore::File(_) => StoreBackend::File,
            AnyRunStore::Memory(_) => StoreBackend::Memory,
        }
    }
}

/// Open the backend named by `config`, resolving default locations under
/// `data_dir`.
pub async fn open_run_store(config: &StoreConfig, data_dir: &Path) -> Result<AnyRunStore, StoreError> {
    let store = match config.backend {
        StoreBackend::Sqlite => {
            let url = config
                .database_url
                .clone()
                .unwrap_or_else(|| database_url_for(data_dir));
            tokio::fs::create_dir_all(data_dir)
                .await
                .map_err(|e| RepositoryError::Query(format!("create {}: {e}", data_dir.display())))?;
            AnyRunStore::Sqlite(SqliteRunStore::new(DatabasePool::new(&url).await?))
        }
        StoreBackend::File => {
            let dir = config
                .runs_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("runs"));
            AnyRunStore::File(FileRunStore::open(dir).await?)
        }
        StoreBackend::Memory => AnyRunStore::Memory(InMemoryRunStore::new()),
    };
    tracing::debug!(backend = ?store.backend(), "opened run store");
    Ok(store)
}

impl RunStore for AnyRunStore {
    async fn put_run(&self, record: &RunRecord) -> Result<(), RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.put_run(record).await,
            AnyRunStore::File(s) => s.put_run(record).await,
            AnyRunStore::Memory(s) => s.put_run(record).await,
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.get_run(run_id).await,
            AnyRunStore::File(s) => s.get_run(run_id).await,
            AnyRunStore::Memory(s) => s.get_run(run_id).await,
        }
    }

    async fn list_runs_by_workflow(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.list_runs_by_workflow(workflow_id, limit).await,
            AnyRunStore::File(s) => s.list_runs_by_workflow(workflow_id, limit).await,
            AnyRunStore::Memory(s) => s.list_runs_by_workflow(workflow_id, limit).await,
        }
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.list_runs_by_status(status, limit).await,
            AnyRunStore::File(s) => s.list_runs_by_status(status, limit).await,
            AnyRunStore::Memory(s) => s.list_runs_by_status(status, limit).await,
        }
    }

    async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<RunRecord>, RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.list_runs(limit).await,
            AnyRunStore::File(s) => s.list_runs(limit).await,
            AnyRunStore::Memory(s) => s.list_runs(limit).await,
        }
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        match self {
            AnyRunStore::Sqlite(s) => s.delete_run(run_id).await,
            AnyRunStore::File(s) => s.delete_run(run_id).await,
            AnyRunStore::Memory(s) => s.delete_run(run_id).await,
        }
    }
}
