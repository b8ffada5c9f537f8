//! Testing utilities for rpaflow.
//!
//! This module provides:
//! - A scripted stage executor
//! - The four-stage reference pipeline and a test harness
//! - Assertions for run records and event streams

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_attempts_contiguous, assert_event_kinds, assert_run_status, assert_stage_statuses,
};
pub use fixtures::{rpa_pipeline, TestHarness, RPA_PIPELINE, RPA_STAGES};
pub use mocks::{RecordedCall, ScriptedExecutor, ScriptedResponse};
