//! Lifecycle notification events emitted by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use super::run::{FailureCause, PipelineRun, RunId, StageRecord};
use super::status::AttemptStatus;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The run moved to RUNNING.
    RunStarted,
    /// A stage finished successfully.
    StageSucceeded,
    /// A stage failed terminally.
    StageFailed,
    /// The run finished with every stage succeeded.
    RunSucceeded,
    /// The run finished FAILED.
    RunFailed,
    /// The run finished CANCELLED.
    RunCancelled,
}

impl EventKind {
    /// Returns true for events that close a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunSucceeded | Self::RunFailed | Self::RunCancelled)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RunStarted => "run_started",
            Self::StageSucceeded => "stage_succeeded",
            Self::StageFailed => "stage_failed",
            Self::RunSucceeded => "run_succeeded",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
        };
        f.write_str(s)
    }
}

/// Key that identifies a logical notification.
///
/// Two events with equal keys describe the same transition; consumers use it
/// to drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// The run the event belongs to.
    pub run_id: RunId,
    /// The event kind.
    pub kind: EventKind,
    /// The stage, for stage-level events.
    pub stage_id: Option<String>,
}

impl IdempotencyKey {
    /// Stable fingerprint of the key, usable across processes.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let combined = format!(
            "{}:{}:{}",
            self.run_id,
            self.kind,
            self.stage_id.as_deref().unwrap_or("")
        );
        let mut hasher = Sha256::new();
        hasher.update(combined.as_bytes());
        let result = hasher.finalize();
        format!("idem:{}", hex::encode(&result[..16]))
    }
}

/// A lifecycle notification handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Event kind.
    pub kind: EventKind,
    /// The run the event belongs to.
    pub run_id: RunId,
    /// Pipeline identity.
    pub pipeline_id: String,
    /// Stage, for stage-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Event details.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(kind: EventKind, run: &PipelineRun, stage_id: Option<&str>) -> Self {
        Self {
            kind,
            run_id: run.run_id,
            pipeline_id: run.pipeline_id.clone(),
            stage_id: stage_id.map(String::from),
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// The deduplication key of this event.
    #[must_use]
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            run_id: self.run_id,
            kind: self.kind,
            stage_id: self.stage_id.clone(),
        }
    }

    /// `run_started`: trigger, mode, stages and parameters.
    #[must_use]
    pub fn run_started(run: &PipelineRun) -> Self {
        Self::new(EventKind::RunStarted, run, None)
            .with("trigger", json!(run.trigger))
            .with("mode", json!(run.mode))
            .with("stages", json!(run.stage_ids()))
            .with("parameters", Value::Object(run.parameters.clone()))
            .with("degraded", json!(run.degraded))
    }

    /// `stage_succeeded`: attempts used, duration and output keys.
    #[must_use]
    pub fn stage_succeeded(run: &PipelineRun, stage: &StageRecord) -> Self {
        let output_keys: Vec<&String> = stage
            .output
            .as_ref()
            .map(|o| o.keys().collect())
            .unwrap_or_default();
        Self::new(EventKind::StageSucceeded, run, Some(&stage.stage_id))
            .with("attempts", json!(stage.attempt_count()))
            .with("duration_ms", json!(stage.total_attempt_ms()))
            .with("output_keys", json!(output_keys))
    }

    /// `stage_failed`: attempts used and the last error.
    #[must_use]
    pub fn stage_failed(run: &PipelineRun, stage: &StageRecord) -> Self {
        let last = stage.last_attempt();
        let error = last.and_then(|a| a.error.as_ref());
        Self::new(EventKind::StageFailed, run, Some(&stage.stage_id))
            .with("attempts", json!(stage.attempt_count()))
            .with("duration_ms", json!(stage.total_attempt_ms()))
            .with("error_kind", json!(error.map(|e| e.kind.clone())))
            .with("error_message", json!(error.map(|e| e.message.clone())))
            .with(
                "timed_out",
                json!(last.is_some_and(|a| a.status == AttemptStatus::TimedOut)),
            )
    }

    /// `run_succeeded`: total duration.
    #[must_use]
    pub fn run_succeeded(run: &PipelineRun) -> Self {
        Self::new(EventKind::RunSucceeded, run, None)
            .with("duration_ms", json!(run.duration_ms()))
            .with("degraded", json!(run.degraded))
    }

    /// `run_failed`: terminal cause and skipped stages.
    #[must_use]
    pub fn run_failed(run: &PipelineRun, cause: &FailureCause, skipped: &[String]) -> Self {
        Self::new(EventKind::RunFailed, run, None)
            .with("duration_ms", json!(run.duration_ms()))
            .with("error_kind", json!(cause.kind))
            .with("error_detail_kind", json!(cause.detail_kind))
            .with("error_message", json!(cause.message))
            .with("failed_stage", json!(cause.stage_id))
            .with("skipped", json!(skipped))
            .with("degraded", json!(run.degraded))
    }

    /// `run_cancelled`: reason and skipped stages.
    #[must_use]
    pub fn run_cancelled(run: &PipelineRun, reason: &str, skipped: &[String]) -> Self {
        Self::new(EventKind::RunCancelled, run, None)
            .with("duration_ms", json!(run.duration_ms()))
            .with("reason", json!(reason))
            .with("skipped", json!(skipped))
            .with("degraded", json!(run.degraded))
    }
}
