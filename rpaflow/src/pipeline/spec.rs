//! Pipeline and stage definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::retry::RetryPolicy;
use crate::errors::OrchestratorError;

/// Definition of one stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// The unique stage identifier within the pipeline.
    pub stage_id: String,
    /// Retry, timeout and backoff for this stage.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Keep going with later stages when this one fails.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StageDefinition {
    /// Creates a stage with the default retry policy.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            retry: RetryPolicy::default(),
            continue_on_failure: false,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lets the run continue past a failure of this stage.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Ordered list of stages under one pipeline identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identity, the unit of exclusivity.
    pub pipeline_id: String,
    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
    /// Stop at the first terminal stage failure.
    #[serde(default = "default_halt_on_failure")]
    pub halt_on_failure: bool,
}

fn default_halt_on_failure() -> bool {
    true
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stages: Vec::new(),
            halt_on_failure: true,
        }
    }

    /// Creates a definition whose stages all share one retry policy.
    #[must_use]
    pub fn uniform<I, S>(pipeline_id: impl Into<String>, stage_ids: I, retry: &RetryPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        stage_ids
            .into_iter()
            .fold(Self::new(pipeline_id), |def, id| {
                def.stage(StageDefinition::new(id).with_retry(retry.clone()))
            })
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets `halt_on_failure`.
    #[must_use]
    pub fn with_halt_on_failure(mut self, halt: bool) -> Self {
        self.halt_on_failure = halt;
        self
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get_stage(&self, stage_id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Stage ids in order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.stage_id.clone()).collect()
    }

    /// Whether a terminal failure of `stage` ends the run.
    #[must_use]
    pub fn halts_after(&self, stage: &StageDefinition) -> bool {
        self.halt_on_failure && !stage.continue_on_failure
    }

    /// Validates identity, stage list and every retry policy.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "pipeline identity cannot be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "pipeline '{}' has no stages",
                self.pipeline_id
            )));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.stage_id.trim().is_empty() {
                return Err(OrchestratorError::Configuration(format!(
                    "pipeline '{}' has a stage with an empty id",
                    self.pipeline_id
                )));
            }
            if !seen.insert(stage.stage_id.as_str()) {
                return Err(OrchestratorError::Configuration(format!(
                    "pipeline '{}' declares stage '{}' twice",
                    self.pipeline_id, stage.stage_id
                )));
            }
            stage.retry.validate().map_err(|e| {
                OrchestratorError::Configuration(format!("stage '{}': {e}", stage.stage_id))
            })?;
        }
        Ok(())
    }

    /// A one-stage definition for a single-stage run.
    pub fn single(&self, stage_id: &str) -> Result<Self, OrchestratorError> {
        let stage = self.get_stage(stage_id).ok_or_else(|| {
            OrchestratorError::NotFound(format!(
                "stage '{stage_id}' in pipeline '{}'",
                self.pipeline_id
            ))
        })?;
        Ok(Self {
            pipeline_id: self.pipeline_id.clone(),
            stages: vec![stage.clone()],
            halt_on_failure: self.halt_on_failure,
        })
    }
}
