//! Stage executor capability and helpers.
//!
//! The orchestrator never runs business logic itself. It hands each stage to
//! a [`StageExecutor`], which returns either a [`StageOutcome`] or a
//! [`StageFailure`] carrying the error kind used for retry classification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Parameters handed to a stage: the run's trigger parameters plus the
/// outputs of earlier stages under [`STAGE_OUTPUTS_KEY`].
pub type StageParams = Map<String, Value>;

/// Key under which previous stage outputs are passed to later stages.
pub const STAGE_OUTPUTS_KEY: &str = "stages";

/// Error kind reported when no executor is registered for a stage.
pub const UNKNOWN_STAGE_KIND: &str = "unknown_stage";

/// Successful result of a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Data handed to later stages and stored on the stage record.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Optional human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageOutcome {
    /// An outcome without data.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Failure reported by a stage executor.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageFailure {
    /// Classification matched against the retry policy's retryable kinds.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl StageFailure {
    /// Creates a new failure.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A `"transient"` failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("transient", message)
    }

    /// A failure for a stage nobody can execute.
    #[must_use]
    pub fn unknown_stage(stage_id: &str) -> Self {
        Self::new(UNKNOWN_STAGE_KIND, format!("no executor registered for stage '{stage_id}'"))
    }
}

/// Capability that executes one stage.
///
/// Implementations must be cancellation-tolerant: when an attempt times out
/// the orchestrator stops awaiting it, but the call itself keeps running.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes `stage_id` with the given parameters.
    async fn execute(&self, stage_id: &str, params: StageParams) -> Result<StageOutcome, StageFailure>;
}

/// A stage executor backed by an async closure.
pub struct FnStageExecutor<F> {
    func: F,
}

impl<F, Fut> FnStageExecutor<F>
where
    F: Fn(String, StageParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutcome, StageFailure>> + Send,
{
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnStageExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStageExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageExecutor for FnStageExecutor<F>
where
    F: Fn(String, StageParams) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutcome, StageFailure>> + Send,
{
    async fn execute(&self, stage_id: &str, params: StageParams) -> Result<StageOutcome, StageFailure> {
        (self.func)(stage_id.to_string(), params).await
    }
}

/// Routes each stage id to its own executor.
#[derive(Default, Clone)]
pub struct StageRouter {
    routes: HashMap<String, Arc<dyn StageExecutor>>,
}

impl StageRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the executor for a stage.
    #[must_use]
    pub fn route(mut self, stage_id: impl Into<String>, executor: Arc<dyn StageExecutor>) -> Self {
        self.routes.insert(stage_id.into(), executor);
        self
    }

    /// Returns true if a stage has an executor.
    #[must_use]
    pub fn handles(&self, stage_id: &str) -> bool {
        self.routes.contains_key(stage_id)
    }

    /// Registered stage ids, sorted.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Debug for StageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRouter")
            .field("stages", &self.stage_ids())
            .finish()
    }
}

#[async_trait]
impl StageExecutor for StageRouter {
    async fn execute(&self, stage_id: &str, params: StageParams) -> Result<StageOutcome, StageFailure> {
        match self.routes.get(stage_id) {
            Some(executor) => executor.execute(stage_id, params).await,
            None => Err(StageFailure::unknown_stage(stage_id)),
        }
    }
}
