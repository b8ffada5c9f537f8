//! Error types for the rpaflow orchestration core.
//!
//! Every failure the core can report is a value of [`OrchestratorError`].
//! Each variant maps onto one [`ErrorKind`], which is what gets persisted in
//! run records and notification payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{RunId, RunStatus};
use crate::stages::StageFailure;

/// Coarse classification of orchestrator errors.
///
/// This is the stable, serializable part of an error: it is stored in
/// [`crate::core::FailureCause`] and surfaced to API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A non-terminal run already exists for the pipeline identity.
    AlreadyRunning,
    /// A stage attempt exceeded its deadline.
    StageTimeout,
    /// The stage executor reported a failure.
    StageExecution,
    /// The execution store could not persist a record.
    Persistence,
    /// A notification sink failed to deliver an event.
    NotificationDelivery,
    /// A run was interrupted (process crash or abandoned persistence).
    Interrupted,
    /// The requested operation does not fit the run's current status.
    InvalidState,
    /// The referenced run, pipeline, stage or schedule does not exist.
    NotFound,
    /// Invalid configuration or definition.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyRunning => "already_running",
            Self::StageTimeout => "stage_timeout",
            Self::StageExecution => "stage_execution",
            Self::Persistence => "persistence",
            Self::NotificationDelivery => "notification_delivery",
            Self::Interrupted => "interrupted",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// The main error type for orchestrator operations.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// Exclusivity violated: the pipeline identity already has an active run.
    #[error("pipeline '{pipeline_id}' already has an active run{}", fmt_active(.active_run_id))]
    AlreadyRunning {
        /// The pipeline identity.
        pipeline_id: String,
        /// The run currently holding the pipeline, when known.
        active_run_id: Option<RunId>,
    },

    /// A stage attempt did not return before its deadline.
    #[error("stage '{stage_id}' attempt {attempt} timed out after {timeout_ms}ms")]
    StageTimeout {
        /// The stage identifier.
        stage_id: String,
        /// The attempt number (1-based).
        attempt: u32,
        /// The configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The stage executor reported a failure.
    #[error("stage '{stage_id}' failed: {failure}")]
    StageExecution {
        /// The stage identifier.
        stage_id: String,
        /// The failure returned by the executor.
        failure: StageFailure,
    },

    /// The execution store could not persist a record, including the fallback.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A notification could not be delivered.
    #[error("{0}")]
    NotificationDelivery(#[from] NotificationDeliveryError),

    /// The run was interrupted before reaching a terminal status.
    #[error("run {run_id} interrupted: {reason}")]
    Interrupted {
        /// The interrupted run.
        run_id: RunId,
        /// Why the run was interrupted.
        reason: String,
    },

    /// The operation is not allowed in the run's current status.
    #[error("run {run_id} is {status}: {message}")]
    InvalidState {
        /// The run the operation targeted.
        run_id: RunId,
        /// The status the run was in.
        status: RunStatus,
        /// What was attempted.
        message: String,
    },

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration or pipeline definition.
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn fmt_active(active: &Option<RunId>) -> String {
    active.map(|id| format!(" ({id})")).unwrap_or_default()
}

impl OrchestratorError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::StageTimeout { .. } => ErrorKind::StageTimeout,
            Self::StageExecution { .. } => ErrorKind::StageExecution,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::NotificationDelivery(_) => ErrorKind::NotificationDelivery,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Creates a not-found error for a run id.
    #[must_use]
    pub fn run_not_found(run_id: RunId) -> Self {
        Self::NotFound(format!("run {run_id}"))
    }

    /// Returns true when the error signals an exclusivity conflict.
    #[must_use]
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

/// Error returned by a notification sink that failed to deliver an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification delivery failed via '{sink}': {message}")]
pub struct NotificationDeliveryError {
    /// Name of the sink that failed.
    pub sink: String,
    /// What went wrong.
    pub message: String,
}

impl NotificationDeliveryError {
    /// Creates a new delivery error.
    #[must_use]
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend cannot be reached right now.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}
