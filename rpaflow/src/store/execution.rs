//! The execution store: system of record for runs.
//!
//! Writes go to the primary [`RunRepository`]. When it is unreachable the
//! snapshot is appended to the [`FallbackLog`] with `degraded = true`, and a
//! later reconciliation pass moves it back. Only when both fail does `save`
//! report a persistence error.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fallback::FallbackLog;
use super::repository::{RunQuery, RunRepository};
use crate::cancellation::CancellationToken;
use crate::config::PersistenceConfig;
use crate::core::{FailureCause, PipelineRun, RunId, RunStatus, StageStatus};
use crate::errors::OrchestratorError;

/// Where a save landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    /// Written to the primary repository.
    Primary,
    /// Written to the fallback log only.
    Degraded,
}

impl SaveOutcome {
    /// Returns true if the record only reached the fallback.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Degraded records moved to the primary.
    pub resaved: usize,
    /// Abandoned terminal records written.
    pub flushed: usize,
    /// Records still only in the fallback.
    pub remaining: usize,
}

/// Aggregate statistics over stored runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// All known runs.
    pub total: usize,
    /// Runs started on the current UTC day.
    pub today: usize,
    /// Percentage of finished runs in the last 30 days that succeeded.
    pub success_rate_30d: f64,
    /// Run count per status.
    pub by_status: BTreeMap<String, usize>,
    /// Runs whose latest snapshot is degraded.
    pub degraded: usize,
}

/// Store health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    /// Whether the primary answered a ping.
    pub primary_reachable: bool,
    /// Records held only by the fallback log.
    pub degraded_records: usize,
    /// Abandoned records waiting to be written.
    pub pending_records: usize,
    /// Pipelines with a non-terminal run, sorted.
    pub active_pipelines: Vec<String>,
}

/// Durable run records with a degraded fallback.
pub struct ExecutionStore {
    primary: Arc<dyn RunRepository>,
    fallback: FallbackLog,
    active: DashMap<String, HashSet<RunId>>,
    pending: Mutex<HashMap<RunId, PipelineRun>>,
    write_locks: DashMap<RunId, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for ExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStore")
            .field("fallback", &self.fallback)
            .field("active_pipelines", &self.active.len())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl ExecutionStore {
    /// Creates a store without running startup recovery.
    #[must_use]
    pub fn new(primary: Arc<dyn RunRepository>, fallback: FallbackLog) -> Self {
        Self {
            primary,
            fallback,
            active: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            write_locks: DashMap::new(),
        }
    }

    /// Creates a store with an in-memory fallback.
    #[must_use]
    pub fn in_memory(primary: Arc<dyn RunRepository>) -> Self {
        Self::new(primary, FallbackLog::in_memory())
    }

    /// Opens the fallback log from `config` and runs startup recovery.
    pub async fn open(
        primary: Arc<dyn RunRepository>,
        config: &PersistenceConfig,
    ) -> Result<Self, OrchestratorError> {
        let fallback = match &config.fallback_log {
            Some(path) => FallbackLog::open(path).map_err(|e| {
                OrchestratorError::Persistence(format!(
                    "cannot open fallback log {}: {e}",
                    path.display()
                ))
            })?,
            None => FallbackLog::in_memory(),
        };
        let store = Self::new(primary, fallback);
        let recovered = store.recover(Utc::now()).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Marked interrupted runs as failed");
        }
        Ok(store)
    }

    fn lock_for(&self, run_id: RunId) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks.entry(run_id).or_default().clone()
    }

    fn index(&self, run: &PipelineRun) {
        if run.is_terminal() {
            let emptied = self
                .active
                .get_mut(&run.pipeline_id)
                .map(|mut ids| {
                    ids.remove(&run.run_id);
                    ids.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                self.active.remove_if(&run.pipeline_id, |_, ids| ids.is_empty());
            }
        } else {
            self.active
                .entry(run.pipeline_id.clone())
                .or_default()
                .insert(run.run_id);
        }
    }

    /// Drops a held snapshot the primary has already moved past.
    fn discard_stale(&self, held: &PipelineRun, primary: &PipelineRun) {
        warn!(
            run_id = %held.run_id,
            status = %held.status,
            "Discarding fallback snapshot older than the primary record"
        );
        if let Err(e) = self.fallback.remove(held.run_id) {
            warn!(run_id = %held.run_id, error = %e, "Could not clear fallback entry");
        }
        self.index(primary);
    }

    async fn write(&self, run: &PipelineRun) -> Result<SaveOutcome, OrchestratorError> {
        let mut record = run.clone();
        record.degraded = false;

        match self.primary.put(&record).await {
            Ok(()) => {
                if let Err(e) = self.fallback.remove(record.run_id) {
                    warn!(run_id = %record.run_id, error = %e, "Could not clear fallback entry");
                }
                self.index(&record);
                Ok(SaveOutcome::Primary)
            }
            Err(primary_err) => {
                warn!(
                    run_id = %record.run_id,
                    status = %record.status,
                    error = %primary_err,
                    "Primary store unavailable, writing degraded record"
                );
                record.degraded = true;
                self.fallback.append(&record).map_err(|fallback_err| {
                    error!(
                        run_id = %record.run_id,
                        error = %fallback_err,
                        "Fallback log write failed"
                    );
                    OrchestratorError::Persistence(format!(
                        "primary: {primary_err}; fallback: {fallback_err}"
                    ))
                })?;
                self.index(&record);
                Ok(SaveOutcome::Degraded)
            }
        }
    }

    /// Persists a snapshot of `run`, atomically per run.
    ///
    /// The caller's `degraded` flag is ignored; it is set from where the
    /// record lands.
    pub async fn save(&self, run: &PipelineRun) -> Result<SaveOutcome, OrchestratorError> {
        let outcome = {
            let lock = self.lock_for(run.run_id);
            let _guard = lock.lock().await;
            self.write(run).await?
        };
        if run.is_terminal() {
            self.write_locks.remove(&run.run_id);
        }
        if outcome == SaveOutcome::Primary {
            self.flush_pending().await;
        }
        Ok(outcome)
    }

    /// Queues a terminal record that could not be persisted.
    ///
    /// It is served by reads right away and written on the next successful
    /// persistence.
    pub fn enqueue_abandoned(&self, run: PipelineRun) {
        warn!(
            run_id = %run.run_id,
            pipeline = %run.pipeline_id,
            status = %run.status,
            "Queueing abandoned run record"
        );
        self.index(&run);
        self.pending.lock().insert(run.run_id, run);
    }

    async fn flush_pending(&self) -> usize {
        let queued: Vec<PipelineRun> = self.pending.lock().values().cloned().collect();
        let mut flushed = 0;
        for run in queued {
            let lock = self.lock_for(run.run_id);
            let _guard = lock.lock().await;
            match self.write(&run).await {
                Ok(_) => {
                    self.pending.lock().remove(&run.run_id);
                    flushed += 1;
                    info!(run_id = %run.run_id, "Abandoned run record written");
                }
                Err(e) => {
                    debug!(run_id = %run.run_id, error = %e, "Abandoned record still pending");
                }
            }
        }
        flushed
    }

    /// Best-known state of a run.
    ///
    /// Queued and degraded snapshots are newer than anything in the primary,
    /// so they win, unless the primary already holds a terminal record the
    /// snapshot lacks. Primary errors are logged, never returned.
    pub async fn get(&self, run_id: RunId) -> Option<PipelineRun> {
        if let Some(run) = self.pending.lock().get(&run_id).cloned() {
            return Some(run);
        }
        let held = self.fallback.get(run_id);
        let primary = match self.primary.get(run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Primary read failed");
                None
            }
        };
        match (held, primary) {
            (Some(held), Some(primary)) if is_stale(&held, &primary) => {
                self.discard_stale(&held, &primary);
                Some(primary)
            }
            (Some(held), _) => Some(held),
            (None, primary) => primary,
        }
    }

    /// Runs matching `query`, newest first, merged across primary, fallback
    /// and queued records.
    pub async fn list(&self, query: &RunQuery) -> Vec<PipelineRun> {
        let mut merged: HashMap<RunId, PipelineRun> = match self.primary.list(&query.unlimited()).await {
            Ok(runs) => runs.into_iter().map(|r| (r.run_id, r)).collect(),
            Err(e) => {
                warn!(error = %e, "Primary list failed, serving fallback records only");
                HashMap::new()
            }
        };
        for run in self.fallback.list() {
            if let Some(primary) = merged.get(&run.run_id).filter(|primary| is_stale(&run, primary)) {
                self.discard_stale(&run, primary);
                continue;
            }
            merged.insert(run.run_id, run);
        }
        for run in self.pending.lock().values() {
            merged.insert(run.run_id, run.clone());
        }
        query.apply(merged.into_values())
    }

    /// Whether the pipeline has a non-terminal run per the latest save.
    #[must_use]
    pub fn exists_active(&self, pipeline_id: &str) -> bool {
        self.active
            .get(pipeline_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Non-terminal runs of a pipeline.
    #[must_use]
    pub fn active_runs(&self, pipeline_id: &str) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .active
            .get(pipeline_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Startup recovery: fails every run left non-terminal and rebuilds the
    /// active index.
    ///
    /// Returns the ids of the runs that were interrupted.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<Vec<RunId>, OrchestratorError> {
        self.recover_except(now, &HashSet::new()).await
    }

    /// Like [`recover`](Self::recover), but leaves the runs in `live` alone.
    /// They stay in the active index.
    pub async fn recover_except(
        &self,
        now: DateTime<Utc>,
        live: &HashSet<RunId>,
    ) -> Result<Vec<RunId>, OrchestratorError> {
        self.active.clear();
        let mut interrupted = Vec::new();

        for mut run in self.list(&RunQuery::all()).await {
            if run.is_terminal() {
                continue;
            }
            if live.contains(&run.run_id) {
                self.index(&run);
                continue;
            }
            for stage in &mut run.stages {
                match stage.status {
                    StageStatus::Attempting | StageStatus::Retrying => stage.status = StageStatus::Failed,
                    StageStatus::Pending => stage.status = StageStatus::Skipped,
                    _ => {}
                }
            }
            let cause = FailureCause::interrupted(format!(
                "run was {} when the orchestrator stopped",
                run.status
            ));
            run.finish(RunStatus::Failed, Some(cause), now)?;
            self.save(&run).await?;
            warn!(run_id = %run.run_id, pipeline = %run.pipeline_id, "Recovered interrupted run");
            interrupted.push(run.run_id);
        }
        Ok(interrupted)
    }

    /// Moves degraded records back to the primary and writes queued ones.
    pub async fn reconcile(&self) -> ReconcileReport {
        if let Err(e) = self.primary.ping().await {
            debug!(error = %e, "Primary still unreachable, skipping reconciliation");
            return ReconcileReport {
                resaved: 0,
                flushed: 0,
                remaining: self.fallback.len(),
            };
        }

        let mut resaved = 0;
        for candidate in self.fallback.list() {
            let lock = self.lock_for(candidate.run_id);
            let _guard = lock.lock().await;
            // re-read under the lock; the run task may have saved since
            let Some(mut run) = self.fallback.get(candidate.run_id) else {
                continue;
            };
            if let Ok(Some(primary)) = self.primary.get(run.run_id).await {
                if is_stale(&run, &primary) {
                    self.discard_stale(&run, &primary);
                    continue;
                }
            }
            run.degraded = false;
            match self.primary.put(&run).await {
                Ok(()) => {
                    if let Err(e) = self.fallback.remove(run.run_id) {
                        warn!(run_id = %run.run_id, error = %e, "Could not clear fallback entry");
                    }
                    self.index(&run);
                    resaved += 1;
                    info!(run_id = %run.run_id, status = %run.status, "Reconciled degraded record");
                }
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "Reconciliation write failed");
                    break;
                }
            }
        }

        let flushed = self.flush_pending().await;
        if let Err(e) = self.fallback.compact() {
            warn!(error = %e, "Fallback log compaction failed");
        }

        ReconcileReport {
            resaved,
            flushed,
            remaining: self.fallback.len(),
        }
    }

    /// Deletes a finished run.
    pub async fn delete(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        let run = self
            .get(run_id)
            .await
            .ok_or_else(|| OrchestratorError::run_not_found(run_id))?;
        if !run.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                run_id,
                status: run.status,
                message: "cannot delete an active run".to_string(),
            });
        }

        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        self.primary
            .delete(run_id)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        self.fallback
            .remove(run_id)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        self.pending.lock().remove(&run_id);
        self.write_locks.remove(&run_id);
        debug!(run_id = %run_id, "Run deleted");
        Ok(())
    }

    /// Deletes every finished run. Returns how many were removed.
    pub async fn purge_terminal(&self) -> Result<usize, OrchestratorError> {
        let mut removed = 0;
        for run in self.list(&RunQuery::all()).await {
            if run.is_terminal() {
                self.delete(run.run_id).await?;
                removed += 1;
            }
        }
        info!(removed, "Purged finished runs");
        Ok(removed)
    }

    /// Totals, today's runs and the 30-day success rate.
    pub async fn stats(&self, now: DateTime<Utc>) -> RunStats {
        let runs = self.list(&RunQuery::all()).await;
        let today = now.date_naive();
        let window_start = now - ChronoDuration::days(30);

        let mut by_status = BTreeMap::new();
        let (mut finished, mut succeeded) = (0_usize, 0_usize);
        for run in &runs {
            *by_status.entry(run.status.to_string()).or_insert(0) += 1;
            if run.started_at >= window_start && run.is_terminal() {
                finished += 1;
                if run.status == RunStatus::Succeeded {
                    succeeded += 1;
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let success_rate_30d = if finished == 0 {
            0.0
        } else {
            (succeeded as f64 / finished as f64 * 1000.0).round() / 10.0
        };

        RunStats {
            total: runs.len(),
            today: runs.iter().filter(|r| r.started_at.date_naive() == today).count(),
            success_rate_30d,
            by_status,
            degraded: runs.iter().filter(|r| r.degraded).count(),
        }
    }

    /// Reachability and backlog of the store.
    pub async fn health(&self) -> StoreHealth {
        let primary_reachable = self.primary.ping().await.is_ok();
        let mut active_pipelines: Vec<String> = self
            .active
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        active_pipelines.sort();

        StoreHealth {
            primary_reachable,
            degraded_records: self.fallback.len(),
            pending_records: self.pending.lock().len(),
            active_pipelines,
        }
    }

    /// Runs [`reconcile`](Self::reconcile) every `every` until `cancel` fires.
    pub fn spawn_reconcile_loop(
        self: &Arc<Self>,
        every: Duration,
        cancel: Arc<CancellationToken>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Reconcile loop started");
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Reconcile loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if store.fallback.is_empty() && store.pending.lock().is_empty() {
                            continue;
                        }
                        let report = store.reconcile().await;
                        if report.resaved > 0 || report.flushed > 0 {
                            info!(
                                resaved = report.resaved,
                                flushed = report.flushed,
                                remaining = report.remaining,
                                "Reconciliation pass finished"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// A held snapshot is stale once the primary has a terminal record and the
/// snapshot is not terminal. Terminal records are never rewritten.
fn is_stale(held: &PipelineRun, primary: &PipelineRun) -> bool {
    primary.is_terminal() && !held.is_terminal()
}
