//! Run store keeping each run as `{runs_dir}/{run_id}.json`.
//!
//! Writes go to a temporary sibling file and are renamed into place, so a
//! reader never observes a half-written record. Listings scan the directory;
//! this backend suits local development and small deployments.

use std::path::{Path, PathBuf};

use trellis_core::repository::run::RunStore;
use trellis_types::error::RepositoryError;
use trellis_types::workflow::{RunRecord, RunStatus};
use uuid::Uuid;

pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            tracing::warn!("Failed to create runs directory {}: {e}", dir.display());
            RepositoryError::Connection
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read_record(path: &Path) -> Result<Option<RunRecord>, RepositoryError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepositoryError::Query(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| RepositoryError::Query(format!("invalid run file {}: {e}", path.display())))
    }

    /// Every parseable record, newest first. Unreadable files are skipped
    /// with a warning.
    async fn scan(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| RepositoryError::Query(format!("list {}: {e}", self.dir.display())))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping run file: {e}"),
            }
        }

        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(records)
    }
}

fn take(records: impl Iterator<Item = RunRecord>, limit: Option<u32>) -> Vec<RunRecord> {
    match limit {
        Some(limit) => records.take(limit as usize).collect(),
        None => records.collect(),
    }
}

impl RunStore for FileRunStore {
    async fn put_run(&self, record: &RunRecord) -> Result<(), RepositoryError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| RepositoryError::Query(format!("serialize run: {e}")))?;

        let path = self.path_for(&record.run_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.run_id));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| RepositoryError::Query(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RepositoryError::Query(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Self::read_record(&self.path_for(run_id)).await
    }

    async fn list_runs_by_workflow(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let records = self.scan().await?;
        Ok(take(
            records.into_iter().filter(|r| r.workflow_id == workflow_id),
            limit,
        ))
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: Option<u32>,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let records = self.scan().await?;
        Ok(take(records.into_iter().filter(|r| r.status == status), limit))
    }

    async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<RunRecord>, RepositoryError> {
        let records = self.scan().await?;
        Ok(take(records.into_iter(), limit))
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }
}
