//! Pipeline run records and their stage attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::status::{AttemptStatus, RunMode, RunStatus, StageStatus, TriggerKind};
use crate::errors::{ErrorKind, OrchestratorError};
use crate::utils::elapsed_ms;

/// Identifier of a pipeline run.
pub type RunId = Uuid;

/// Error detail recorded on a failed or timed-out attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    /// The error kind used for retry classification (e.g. `"timeout"`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl AttemptError {
    /// Creates a new attempt error.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// One try at executing a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// 1-based attempt number, contiguous within a stage.
    pub number: u32,
    /// Outcome of the attempt.
    pub status: AttemptStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt ended.
    pub ended_at: DateTime<Utc>,
    /// `ended_at - started_at`, floored at zero.
    pub duration_ms: u64,
    /// Absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
}

/// Per-stage state within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage identifier.
    pub stage_id: String,
    /// Current stage status.
    pub status: StageStatus,
    /// Attempts in order.
    #[serde(default)]
    pub attempts: Vec<StageAttempt>,
    /// Data returned by the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
}

impl StageRecord {
    /// Creates a pending stage record.
    #[must_use]
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            attempts: Vec::new(),
            output: None,
        }
    }

    /// Appends an attempt, numbering it after the existing ones.
    pub fn record_attempt(
        &mut self,
        status: AttemptStatus,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        error: Option<AttemptError>,
    ) -> &StageAttempt {
        let number = u32::try_from(self.attempts.len()).unwrap_or(u32::MAX - 1) + 1;
        self.attempts.push(StageAttempt {
            number,
            status,
            started_at,
            ended_at,
            duration_ms: elapsed_ms(started_at, ended_at),
            error,
        });
        &self.attempts[self.attempts.len() - 1]
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// The most recent attempt, if any.
    #[must_use]
    pub fn last_attempt(&self) -> Option<&StageAttempt> {
        self.attempts.last()
    }

    /// Sum of all attempt durations.
    #[must_use]
    pub fn total_attempt_ms(&self) -> u64 {
        self.attempts.iter().map(|a| a.duration_ms).sum()
    }
}

/// Terminal cause of a failed (or interrupted) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// Orchestrator-level kind.
    pub kind: ErrorKind,
    /// Executor-level kind, when the cause is a stage failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_kind: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// The stage that caused the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
}

impl FailureCause {
    /// Builds a cause from an orchestrator error.
    #[must_use]
    pub fn from_error(err: &OrchestratorError) -> Self {
        let (detail_kind, stage_id) = match err {
            OrchestratorError::StageExecution { stage_id, failure } => {
                (Some(failure.kind.clone()), Some(stage_id.clone()))
            }
            OrchestratorError::StageTimeout { stage_id, .. } => (
                Some(crate::pipeline::TIMEOUT_ERROR_KIND.to_string()),
                Some(stage_id.clone()),
            ),
            _ => (None, None),
        };
        Self {
            kind: err.kind(),
            detail_kind,
            message: err.to_string(),
            stage_id,
        }
    }

    /// An `Interrupted` cause with the given reason.
    #[must_use]
    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Interrupted,
            detail_kind: None,
            message: reason.into(),
            stage_id: None,
        }
    }
}

/// One execution instance of a pipeline.
///
/// The record layout is what gets persisted, both in the primary repository
/// and in the fallback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id (UUID v7).
    pub run_id: RunId,
    /// Pipeline identity.
    pub pipeline_id: String,
    /// What created the run.
    pub trigger: TriggerKind,
    /// Full pipeline or single stage.
    #[serde(default)]
    pub mode: RunMode,
    /// Current status.
    pub status: RunStatus,
    /// Trigger time.
    pub started_at: DateTime<Utc>,
    /// Absent while the run is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Correlation parameters passed to every stage.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Stage records in definition order.
    pub stages: Vec<StageRecord>,
    /// Terminal cause, set on FAILED runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    /// True when this snapshot lives only in the fallback log.
    #[serde(default)]
    pub degraded: bool,
}

impl PipelineRun {
    /// Creates a run in `Created` status with every stage pending.
    #[must_use]
    pub fn new<I, S>(
        run_id: RunId,
        pipeline_id: impl Into<String>,
        trigger: TriggerKind,
        mode: RunMode,
        stage_ids: I,
        parameters: Map<String, Value>,
        started_at: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id,
            pipeline_id: pipeline_id.into(),
            trigger,
            mode,
            status: RunStatus::Created,
            started_at,
            ended_at: None,
            parameters,
            stages: stage_ids.into_iter().map(StageRecord::pending).collect(),
            failure: None,
            degraded: false,
        }
    }

    /// Returns true if the run reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the run to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidState {
                run_id: self.run_id,
                status: self.status,
                message: format!("cannot move to {next}"),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Moves the run to a terminal status and stamps `ended_at`.
    pub fn finish(
        &mut self,
        status: RunStatus,
        failure: Option<FailureCause>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        self.transition(status)?;
        self.failure = failure;
        self.ended_at = Some(ended_at.max(self.started_at));
        Ok(())
    }

    /// Marks every stage that has not started as skipped.
    ///
    /// Returns the skipped stage ids.
    pub fn skip_remaining(&mut self) -> Vec<String> {
        self.stages
            .iter_mut()
            .filter(|s| s.status == StageStatus::Pending)
            .map(|s| {
                s.status = StageStatus::Skipped;
                s.stage_id.clone()
            })
            .collect()
    }

    /// Looks up a stage record.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Looks up a stage record mutably.
    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }

    /// The stage currently being attempted, if any.
    #[must_use]
    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Attempting | StageStatus::Retrying))
    }

    /// Stage ids in definition order.
    #[must_use]
    pub fn stage_ids(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.stage_id.clone()).collect()
    }

    /// Run duration in milliseconds, once the run has ended.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at.map(|end| elapsed_ms(self.started_at, end))
    }

    /// Outputs of succeeded stages keyed by stage id.
    #[must_use]
    pub fn stage_outputs(&self) -> Map<String, Value> {
        self.stages
            .iter()
            .filter_map(|s| {
                s.output
                    .as_ref()
                    .map(|o| (s.stage_id.clone(), Value::Object(o.clone())))
            })
            .collect()
    }
}
