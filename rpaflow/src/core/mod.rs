//! Core domain model types for rpaflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run, stage and attempt status enums
//! - Pipeline run records with their stage attempts
//! - Lifecycle notification events and their idempotency keys

mod event;
mod run;
mod status;

pub use event::{EventKind, IdempotencyKey, NotificationEvent};
pub use run::{AttemptError, FailureCause, PipelineRun, RunId, StageAttempt, StageRecord};
pub use status::{AttemptStatus, RunMode, RunStatus, StageStatus, TriggerKind};
