//! Transport-agnostic operations for outer surfaces (CLI, HTTP, chat bots).
//!
//! Each operation returns a plain `Result`; [`ApiResponse`] wraps one into
//! the `{success, message, data, error_kind}` envelope transports serialize.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::core::{PipelineRun, RunId, RunStatus, TriggerKind};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::orchestrator::Orchestrator;
use crate::scheduler::{ScheduleStatus, SchedulerService};
use crate::store::{RunQuery, RunStats, StoreHealth};
use crate::utils::now_utc;

/// Default page size for [`PipelineApi::runs`].
pub const DEFAULT_RUNS_LIMIT: usize = 30;

/// Request to start a full run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Pipeline identity.
    pub pipeline_id: String,
    /// Correlation parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Request to run one stage on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerStageRequest {
    /// Pipeline identity.
    pub pipeline_id: String,
    /// Stage to run.
    pub stage_id: String,
    /// Correlation parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Response to an accepted trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// The new run.
    pub run_id: RunId,
}

/// Filter for [`PipelineApi::runs`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunsQuery {
    /// Only this pipeline.
    #[serde(default)]
    pub pipeline_id: Option<String>,
    /// Only this status.
    #[serde(default)]
    pub status: Option<RunStatus>,
    /// Page size; defaults to [`DEFAULT_RUNS_LIMIT`].
    #[serde(default)]
    pub limit: Option<usize>,
}

impl From<&RunsQuery> for RunQuery {
    fn from(value: &RunsQuery) -> Self {
        let mut query = RunQuery::all().limit(value.limit.unwrap_or(DEFAULT_RUNS_LIMIT));
        if let Some(pipeline_id) = &value.pipeline_id {
            query = query.pipeline(pipeline_id.clone());
        }
        if let Some(status) = value.status {
            query = query.status(status);
        }
        query
    }
}

/// Overall health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Store health.
    pub store: StoreHealth,
    /// Runs active in this process.
    pub active_runs: Vec<RunId>,
    /// Registered pipelines.
    pub pipelines: Vec<String>,
    /// Schedules, when a scheduler is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedules: Option<Vec<ScheduleStatus>>,
}

/// Serializable envelope around an operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error kind on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl<T> From<Result<T, OrchestratorError>> for ApiResponse<T> {
    fn from(result: Result<T, OrchestratorError>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                message: None,
                data: Some(data),
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                message: Some(e.to_string()),
                data: None,
                error_kind: Some(e.kind()),
            },
        }
    }
}

/// Entry point for transports.
#[derive(Debug, Clone)]
pub struct PipelineApi {
    orchestrator: Orchestrator,
    scheduler: Option<Arc<SchedulerService>>,
}

impl PipelineApi {
    /// Creates the API over an orchestrator.
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            scheduler: None,
        }
    }

    /// Attaches a scheduler so health reports include schedules.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerService>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Starts a full run.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResponse, OrchestratorError> {
        let run_id = self
            .orchestrator
            .trigger(&request.pipeline_id, request.parameters, TriggerKind::Manual)
            .await?;
        Ok(TriggerResponse { run_id })
    }

    /// Runs one stage on its own.
    pub async fn trigger_stage(&self, request: TriggerStageRequest) -> Result<TriggerResponse, OrchestratorError> {
        let run_id = self
            .orchestrator
            .trigger_stage(
                &request.pipeline_id,
                &request.stage_id,
                request.parameters,
                TriggerKind::Manual,
            )
            .await?;
        Ok(TriggerResponse { run_id })
    }

    /// Best-known record of a run.
    pub async fn run(&self, run_id: RunId) -> Result<PipelineRun, OrchestratorError> {
        self.orchestrator.get_run(run_id).await
    }

    /// Runs matching the filter, newest first.
    pub async fn runs(&self, query: &RunsQuery) -> Vec<PipelineRun> {
        self.orchestrator.list_runs(&query.into()).await
    }

    /// Deletes a finished run.
    pub async fn delete_run(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        self.orchestrator.store().delete(run_id).await
    }

    /// Requests cancellation of an active run.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        self.orchestrator.cancel(run_id).await
    }

    /// Store, run and schedule health.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            store: self.orchestrator.store().health().await,
            active_runs: self.orchestrator.active_runs(),
            pipelines: self.orchestrator.pipelines(),
            schedules: self.scheduler.as_ref().map(|s| s.status()),
        }
    }

    /// Aggregate run statistics.
    pub async fn stats(&self) -> RunStats {
        self.orchestrator.store().stats(now_utc()).await
    }

    /// Deletes every finished run. Returns how many were removed.
    pub async fn purge(&self) -> Result<usize, OrchestratorError> {
        self.orchestrator.store().purge_terminal().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RetryPolicy;
    use crate::testing::{rpa_pipeline, ScriptedExecutor, ScriptedResponse, TestHarness, RPA_PIPELINE};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Notify;

    fn api() -> (PipelineApi, TestHarness) {
        let harness = TestHarness::new(rpa_pipeline(&RetryPolicy::default()), ScriptedExecutor::new());
        (PipelineApi::new(harness.orchestrator.clone()), harness)
    }

    fn trigger() -> TriggerRequest {
        TriggerRequest {
            pipeline_id: RPA_PIPELINE.to_string(),
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_trigger_and_query() {
        let (api, harness) = api();
        let TriggerResponse { run_id } = api.trigger(trigger()).await.unwrap();
        harness.orchestrator.wait(run_id).await.unwrap();

        let run = api.run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let runs = api.runs(&RunsQuery::default()).await;
        assert_eq!(runs.len(), 1);
        let failed = api
            .runs(&RunsQuery {
                status: Some(RunStatus::Failed),
                ..RunsQuery::default()
            })
            .await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_runs_default_limit() {
        let (api, harness) = api();
        for _ in 0..(DEFAULT_RUNS_LIMIT + 2) {
            let TriggerResponse { run_id } = api.trigger(trigger()).await.unwrap();
            harness.orchestrator.wait(run_id).await.unwrap();
        }
        assert_eq!(api.runs(&RunsQuery::default()).await.len(), DEFAULT_RUNS_LIMIT);
        let all = api
            .runs(&RunsQuery {
                limit: Some(100),
                ..RunsQuery::default()
            })
            .await;
        assert_eq!(all.len(), DEFAULT_RUNS_LIMIT + 2);
    }

    #[tokio::test]
    async fn test_envelope_carries_error_kind() {
        let (api, _harness) = api();
        let response: ApiResponse<TriggerResponse> = api
            .trigger(TriggerRequest {
                pipeline_id: "missing".to_string(),
                parameters: Map::new(),
            })
            .await
            .into();
        assert!(!response.success);
        assert_eq!(response.error_kind, Some(ErrorKind::NotFound));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error_kind"], json!("not_found"));
        assert!(value.get("data").is_none());
    }

    #[tokio::test]
    async fn test_delete_active_run_is_invalid_state() {
        let gate = Arc::new(Notify::new());
        let executor =
            ScriptedExecutor::new().with_script("collect_indices", [ScriptedResponse::Gate(gate.clone())]);
        let harness = TestHarness::new(rpa_pipeline(&RetryPolicy::default()), executor);
        let api = PipelineApi::new(harness.orchestrator.clone());

        let TriggerResponse { run_id } = api.trigger(trigger()).await.unwrap();
        let err = api.delete_run(run_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        gate.notify_one();
        harness.orchestrator.wait(run_id).await.unwrap();
        api.delete_run(run_id).await.unwrap();
        assert_eq!(api.run(run_id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_health_stats_and_purge() {
        let (api, harness) = api();
        let TriggerResponse { run_id } = api.trigger(trigger()).await.unwrap();
        harness.orchestrator.wait(run_id).await.unwrap();

        let health = api.health().await;
        assert!(health.store.primary_reachable);
        assert!(health.active_runs.is_empty());
        assert_eq!(health.pipelines, vec![RPA_PIPELINE.to_string()]);
        assert!(health.schedules.is_none());

        let stats = api.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status.get("succeeded"), Some(&1));

        assert_eq!(api.purge().await.unwrap(), 1);
        assert_eq!(api.stats().await.total, 0);
    }
}
