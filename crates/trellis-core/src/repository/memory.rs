//! In-memory run store backed by `DashMap`.

use std::sync::Arc;

use dashmap::DashMap;
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{RunRecord, RunStatus};
use uuid::Uuid;

use super::run::RunStore;

/// Process-local `RunStore`. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn collect<F>(&self, limit: Option<u32>, keep: F) -> Vec<RunRecord>
    where
        F: Fn(&RunRecord) -> bool,
    {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.run_id.cmp(&a.run_id)));
        if let Some(limit) = limit {
            runs.truncate(limit as usize);
        }
        runs
    }
}

impl RunStore for InMemoryRunStore {
    async fn put_run(&self, record: &RunRecord) -> Result<(), RepositoryError> {
        self.runs.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn list_runs_by_workflow(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        Ok(self.collect(limit, |r| r.workflow_id == workflow_id))
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        Ok(self.collect(limit, |r| r.status == status))
    }

    async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<RunRecord>, RepositoryError> {
        Ok(self.collect(limit, |_| true))
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.runs.remove(run_id).is_some())
    }
}
