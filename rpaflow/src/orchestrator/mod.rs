//! The orchestrator: run lifecycle, exclusivity and cancellation.
//!
//! Each accepted trigger becomes one tokio task (the run unit) that owns the
//! run record until it is terminal. The orchestrator itself only keeps the
//! pipeline claims and a handle per active run.

mod runner;

#[cfg(test)]
mod integration_tests;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use crate::cancellation::{CancellationToken, CleanupGuard};
use crate::config::{OrchestratorConfig, PersistenceConfig};
use crate::core::{FailureCause, PipelineRun, RunId, RunMode, RunStatus, TriggerKind};
use crate::errors::OrchestratorError;
use crate::events::{NoOpSink, NotificationDispatcher, NotificationSink};
use crate::observability::run_span;
use crate::pipeline::PipelineDefinition;
use crate::stages::StageExecutor;
use crate::store::{ExecutionStore, RunQuery};
use crate::utils::{generate_run_id, now_utc};

use runner::RunUnit;

/// Reason recorded when a run is cancelled through [`Orchestrator::cancel`].
pub const CANCEL_REQUESTED: &str = "cancel requested";

/// Reason recorded when runs are cancelled by [`Orchestrator::shutdown`].
pub const SHUTDOWN_REQUESTED: &str = "orchestrator shutting down";

/// What a pipeline identity is currently held by.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Claim {
    /// A full run.
    Full(RunId),
    /// Single-stage runs, keyed by stage.
    Stages(HashMap<String, RunId>),
}

impl Claim {
    fn any_run(&self) -> Option<RunId> {
        match self {
            Self::Full(id) => Some(*id),
            Self::Stages(stages) => stages.values().next().copied(),
        }
    }
}

struct ActiveRun {
    token: Arc<CancellationToken>,
    done: watch::Receiver<Option<PipelineRun>>,
}

pub(crate) struct Inner {
    executor: Arc<dyn StageExecutor>,
    store: Arc<ExecutionStore>,
    dispatcher: NotificationDispatcher,
    definitions: RwLock<HashMap<String, PipelineDefinition>>,
    claims: Mutex<HashMap<String, Claim>>,
    active: DashMap<RunId, ActiveRun>,
    persistence: PersistenceConfig,
}

impl Inner {
    fn claim(&self, pipeline_id: &str, stage_id: Option<&str>, run_id: RunId) -> Result<(), OrchestratorError> {
        let mut claims = self.claims.lock();
        let conflict = |active_run_id| OrchestratorError::AlreadyRunning {
            pipeline_id: pipeline_id.to_string(),
            active_run_id,
        };

        match (claims.get_mut(pipeline_id), stage_id) {
            (Some(Claim::Full(active)), _) => return Err(conflict(Some(*active))),
            (Some(Claim::Stages(stages)), Some(stage)) => {
                if let Some(active) = stages.get(stage) {
                    return Err(conflict(Some(*active)));
                }
                stages.insert(stage.to_string(), run_id);
                return Ok(());
            }
            (Some(claim), None) => return Err(conflict(claim.any_run())),
            (None, _) => {}
        }

        // runs this orchestrator does not own, as seen by the store
        if self.store.exists_active(pipeline_id) {
            return Err(conflict(self.store.active_runs(pipeline_id).first().copied()));
        }

        let claim = match stage_id {
            None => Claim::Full(run_id),
            Some(stage) => Claim::Stages(HashMap::from([(stage.to_string(), run_id)])),
        };
        claims.insert(pipeline_id.to_string(), claim);
        Ok(())
    }

    fn release(&self, pipeline_id: &str, stage_id: Option<&str>, run_id: RunId) {
        let mut claims = self.claims.lock();
        let remove = match (claims.get_mut(pipeline_id), stage_id) {
            (Some(Claim::Full(active)), None) => *active == run_id,
            (Some(Claim::Stages(stages)), Some(stage)) => {
                if stages.get(stage) == Some(&run_id) {
                    stages.remove(stage);
                }
                stages.is_empty()
            }
            _ => false,
        };
        if remove {
            claims.remove(pipeline_id);
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    executor: Arc<dyn StageExecutor>,
    store: Arc<ExecutionStore>,
    sink: Arc<dyn NotificationSink>,
    definitions: Vec<PipelineDefinition>,
    persistence: PersistenceConfig,
}

impl OrchestratorBuilder {
    /// Sets the notification sink. Defaults to a no-op sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Registers a pipeline definition for [`Orchestrator::trigger`].
    #[must_use]
    pub fn with_definition(mut self, definition: PipelineDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Sets the persistence retry budget settings.
    #[must_use]
    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Applies the persistence section of a loaded configuration.
    #[must_use]
    pub fn with_config(self, config: &OrchestratorConfig) -> Self {
        self.with_persistence(config.persistence.clone())
    }

    /// Builds the orchestrator, validating every registered definition.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let mut definitions = HashMap::new();
        for definition in self.definitions {
            definition.validate()?;
            definitions.insert(definition.pipeline_id.clone(), definition);
        }

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                executor: self.executor,
                store: self.store,
                dispatcher: NotificationDispatcher::new(self.sink),
                definitions: RwLock::new(definitions),
                claims: Mutex::new(HashMap::new()),
                active: DashMap::new(),
                persistence: self.persistence,
            }),
        })
    }
}

/// Sequences stages, enforces exclusivity and tracks active runs.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active_runs", &self.inner.active.len())
            .field("pipelines", &self.inner.definitions.read().len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder(executor: Arc<dyn StageExecutor>, store: Arc<ExecutionStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            executor,
            store,
            sink: Arc::new(NoOpSink),
            definitions: Vec::new(),
            persistence: PersistenceConfig::default(),
        }
    }

    /// The execution store backing this orchestrator.
    #[must_use]
    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.inner.store
    }

    /// Registers or replaces a pipeline definition.
    pub fn register(&self, definition: PipelineDefinition) -> Result<(), OrchestratorError> {
        definition.validate()?;
        self.inner
            .definitions
            .write()
            .insert(definition.pipeline_id.clone(), definition);
        Ok(())
    }

    /// Looks up a registered definition.
    #[must_use]
    pub fn definition(&self, pipeline_id: &str) -> Option<PipelineDefinition> {
        self.inner.definitions.read().get(pipeline_id).cloned()
    }

    /// Registered pipeline identities, sorted.
    #[must_use]
    pub fn pipelines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn registered(&self, pipeline_id: &str) -> Result<PipelineDefinition, OrchestratorError> {
        self.definition(pipeline_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("pipeline '{pipeline_id}'")))
    }

    /// Starts a full run of `definition`.
    ///
    /// Persists CREATED then RUNNING, spawns the run unit and returns
    /// without waiting for any stage.
    pub async fn start(
        &self,
        definition: &PipelineDefinition,
        parameters: Map<String, Value>,
        trigger: TriggerKind,
    ) -> Result<RunId, OrchestratorError> {
        self.launch(definition.clone(), None, parameters, trigger).await
    }

    /// Starts a full run of a registered pipeline.
    pub async fn trigger(
        &self,
        pipeline_id: &str,
        parameters: Map<String, Value>,
        trigger: TriggerKind,
    ) -> Result<RunId, OrchestratorError> {
        let definition = self.registered(pipeline_id)?;
        self.launch(definition, None, parameters, trigger).await
    }

    /// Runs one stage of a registered pipeline on its own.
    ///
    /// Rejected while a full run of the pipeline is active, or while the
    /// same stage is already running on its own.
    pub async fn trigger_stage(
        &self,
        pipeline_id: &str,
        stage_id: &str,
        parameters: Map<String, Value>,
        trigger: TriggerKind,
    ) -> Result<RunId, OrchestratorError> {
        let definition = self.registered(pipeline_id)?.single(stage_id)?;
        self.launch(definition, Some(stage_id.to_string()), parameters, trigger)
            .await
    }

    async fn launch(
        &self,
        definition: PipelineDefinition,
        stage_id: Option<String>,
        parameters: Map<String, Value>,
        trigger: TriggerKind,
    ) -> Result<RunId, OrchestratorError> {
        definition.validate()?;
        let run_id = generate_run_id();
        let pipeline_id = definition.pipeline_id.clone();
        self.inner.claim(&pipeline_id, stage_id.as_deref(), run_id)?;

        let guard = {
            let inner = Arc::clone(&self.inner);
            let pipeline_id = pipeline_id.clone();
            let stage_id = stage_id.clone();
            CleanupGuard::new(move || inner.release(&pipeline_id, stage_id.as_deref(), run_id))
        };

        let mode = if stage_id.is_some() { RunMode::SingleStage } else { RunMode::Full };
        let mut run = PipelineRun::new(
            run_id,
            pipeline_id.clone(),
            trigger,
            mode,
            definition.stage_ids(),
            parameters,
            now_utc(),
        );

        // the guard releases the claim on every early return below
        self.inner.store.save(&run).await?;
        run.transition(RunStatus::Running)?;
        match self.inner.store.save(&run).await {
            Ok(outcome) => run.degraded = outcome.is_degraded(),
            Err(e) => {
                let cause = FailureCause::from_error(&e);
                run.skip_remaining();
                if run.finish(RunStatus::Failed, Some(cause), now_utc()).is_ok() {
                    self.inner.store.enqueue_abandoned(run);
                }
                return Err(e);
            }
        }

        let token = Arc::new(CancellationToken::new());
        let (done_tx, done_rx) = watch::channel(None);
        self.inner.active.insert(
            run_id,
            ActiveRun {
                token: Arc::clone(&token),
                done: done_rx,
            },
        );

        info!(
            run_id = %run_id,
            pipeline = %pipeline_id,
            trigger = %trigger,
            mode = %mode,
            "Run started"
        );

        let span = run_span(&run);
        let inner = Arc::clone(&self.inner);
        let unit = RunUnit::new(Arc::clone(&self.inner), definition, run, token);
        tokio::spawn(
            async move {
                let finished = unit.execute().await;
                guard.run();
                inner.active.remove(&run_id);
                let _ = done_tx.send(Some(finished));
            }
            .instrument(span),
        );

        Ok(run_id)
    }

    /// Requests cooperative cancellation of an active run.
    ///
    /// The run becomes CANCELLED once its in-flight attempt returns.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        let token = self.inner.active.get(&run_id).map(|a| Arc::clone(&a.token));
        if let Some(token) = token {
            if token.cancel(CANCEL_REQUESTED) {
                info!(run_id = %run_id, "Cancellation requested");
            }
            return Ok(());
        }

        match self.inner.store.get(run_id).await {
            None => Err(OrchestratorError::run_not_found(run_id)),
            Some(run) if run.is_terminal() => Err(OrchestratorError::InvalidState {
                run_id,
                status: run.status,
                message: "run already finished".to_string(),
            }),
            Some(run) => Err(OrchestratorError::InvalidState {
                run_id,
                status: run.status,
                message: "run is not owned by this orchestrator".to_string(),
            }),
        }
    }

    /// Waits for a run to finish and returns its terminal record.
    pub async fn wait(&self, run_id: RunId) -> Result<PipelineRun, OrchestratorError> {
        let done = self.inner.active.get(&run_id).map(|a| a.done.clone());
        if let Some(mut done) = done {
            let finished = done.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
            if let Some(run) = finished {
                return Ok(run);
            }
        }

        match self.inner.store.get(run_id).await {
            None => Err(OrchestratorError::run_not_found(run_id)),
            Some(run) if run.is_terminal() => Ok(run),
            Some(run) => Err(OrchestratorError::InvalidState {
                run_id,
                status: run.status,
                message: "run is not owned by this orchestrator".to_string(),
            }),
        }
    }

    /// Best-known record of a run.
    pub async fn get_run(&self, run_id: RunId) -> Result<PipelineRun, OrchestratorError> {
        self.inner
            .store
            .get(run_id)
            .await
            .ok_or_else(|| OrchestratorError::run_not_found(run_id))
    }

    /// Runs matching `query`, newest first.
    pub async fn list_runs(&self, query: &RunQuery) -> Vec<PipelineRun> {
        self.inner.store.list(query).await
    }

    /// Ids of the runs owned by this orchestrator that are still active.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.inner.active.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Returns true if the run is active in this orchestrator.
    #[must_use]
    pub fn is_active(&self, run_id: RunId) -> bool {
        self.inner.active.contains_key(&run_id)
    }

    /// Marks runs left non-terminal by a previous process as interrupted.
    ///
    /// Runs this orchestrator has claimed or is driving are left alone.
    pub async fn recover(&self) -> Result<Vec<RunId>, OrchestratorError> {
        let mut live: HashSet<RunId> = self.inner.active.iter().map(|e| *e.key()).collect();
        for claim in self.inner.claims.lock().values() {
            match claim {
                Claim::Full(run_id) => {
                    live.insert(*run_id);
                }
                Claim::Stages(stages) => live.extend(stages.values().copied()),
            }
        }
        self.inner.store.recover_except(now_utc(), &live).await
    }

    /// Cancels every active run and waits for all of them to finish.
    pub async fn shutdown(&self) -> Vec<PipelineRun> {
        let run_ids = self.active_runs();
        for run_id in &run_ids {
            if let Some(active) = self.inner.active.get(run_id) {
                active.token.cancel(SHUTDOWN_REQUESTED);
            }
        }

        let mut finished = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            match self.wait(run_id).await {
                Ok(run) => finished.push(run),
                Err(e) => warn!(run_id = %run_id, error = %e, "Run did not finish cleanly"),
            }
        }
        info!(runs = finished.len(), "Orchestrator shut down");
        finished
    }
}
