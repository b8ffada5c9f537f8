//! Primary storage capability for run records.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::{PipelineRun, RunId, RunStatus};
use crate::errors::BackendError;

/// Filter for listing runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQuery {
    /// Only runs of this pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    /// Only runs in this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    /// At most this many runs, newest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RunQuery {
    /// Matches every run.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one pipeline.
    #[must_use]
    pub fn pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    /// Restricts to one status.
    #[must_use]
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Keeps only the newest `limit` runs.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The same filter without a limit.
    #[must_use]
    pub fn unlimited(&self) -> Self {
        Self {
            limit: None,
            ..self.clone()
        }
    }

    /// Returns true if `run` passes the filter.
    #[must_use]
    pub fn matches(&self, run: &PipelineRun) -> bool {
        self.pipeline_id
            .as_deref()
            .map_or(true, |p| run.pipeline_id == p)
            && self.status.map_or(true, |s| run.status == s)
    }

    /// Filters, sorts newest first and truncates.
    #[must_use]
    pub fn apply(&self, runs: impl IntoIterator<Item = PipelineRun>) -> Vec<PipelineRun> {
        let mut out: Vec<PipelineRun> = runs.into_iter().filter(|r| self.matches(r)).collect();
        // v7 ids break ties between runs started in the same instant
        out.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Durable storage for run records.
///
/// `put` replaces the whole record for a run id atomically. Implementations
/// report unreachability as [`BackendError::Unavailable`]; the execution
/// store then falls back to its local log.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Inserts or replaces a run record.
    async fn put(&self, run: &PipelineRun) -> Result<(), BackendError>;

    /// Fetches a run record.
    async fn get(&self, run_id: RunId) -> Result<Option<PipelineRun>, BackendError>;

    /// Lists run records matching `query`, newest first.
    async fn list(&self, query: &RunQuery) -> Result<Vec<PipelineRun>, BackendError>;

    /// Removes a run record. Returns false if it did not exist.
    async fn delete(&self, run_id: RunId) -> Result<bool, BackendError>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), BackendError>;
}

/// In-process repository.
///
/// Availability can be toggled to simulate an outage.
#[derive(Debug)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<RunId, PipelineRun>>,
    available: AtomicBool,
}

impl Default for InMemoryRunRepository {
    fn default() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryRunRepository {
    /// Creates an empty, reachable repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the repository reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns true if the repository is reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of stored records, regardless of availability.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    /// Reads a record, ignoring availability.
    #[must_use]
    pub fn peek(&self, run_id: RunId) -> Option<PipelineRun> {
        self.runs.read().get(&run_id).cloned()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::Unavailable("in-memory repository offline".to_string()))
        }
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn put(&self, run: &PipelineRun) -> Result<(), BackendError> {
        self.check()?;
        self.runs.write().insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<PipelineRun>, BackendError> {
        self.check()?;
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn list(&self, query: &RunQuery) -> Result<Vec<PipelineRun>, BackendError> {
        self.check()?;
        let runs: Vec<PipelineRun> = self.runs.read().values().cloned().collect();
        Ok(query.apply(runs))
    }

    async fn delete(&self, run_id: RunId) -> Result<bool, BackendError> {
        self.check()?;
        Ok(self.runs.write().remove(&run_id).is_some())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunMode, TriggerKind};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use uuid::Uuid;

    fn run(pipeline: &str, offset_secs: i64) -> PipelineRun {
        PipelineRun::new(
            Uuid::now_v7(),
            pipeline,
            TriggerKind::Manual,
            RunMode::Full,
            ["a"],
            Map::new(),
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let repo = InMemoryRunRepository::new();
        let record = run("p", 0);
        repo.put(&record).await.unwrap();
        assert_eq!(repo.get(record.run_id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_unavailable_rejects_everything() {
        let repo = InMemoryRunRepository::new();
        repo.set_available(false);
        let record = run("p", 0);
        assert!(matches!(repo.put(&record).await, Err(BackendError::Unavailable(_))));
        assert!(repo.get(record.run_id).await.is_err());
        assert!(repo.ping().await.is_err());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let repo = InMemoryRunRepository::new();
        let old = run("p", -60);
        let new = run("p", 0);
        let mut failed = run("q", -30);
        failed.status = RunStatus::Failed;
        for r in [&old, &new, &failed] {
            repo.put(r).await.unwrap();
        }

        let p_runs = repo.list(&RunQuery::all().pipeline("p")).await.unwrap();
        let ids: Vec<RunId> = p_runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![new.run_id, old.run_id]);

        let failed_runs = repo.list(&RunQuery::all().status(RunStatus::Failed)).await.unwrap();
        assert_eq!(failed_runs.len(), 1);

        let recent = repo.list(&RunQuery::all().limit(1)).await.unwrap();
        assert_eq!(recent[0].run_id, new.run_id);
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = InMemoryRunRepository::new();
        let record = run("p", 0);
        repo.put(&record).await.unwrap();
        assert!(repo.delete(record.run_id).await.unwrap());
        assert!(!repo.delete(record.run_id).await.unwrap());
    }
}
