//! Tracing setup and span helpers.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::PipelineRun;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok(),
    }
}

static TEST_INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs go through the test writer, so they only show for failing tests.
pub fn init_test_tracing() {
    TEST_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Span wrapping a run's task.
#[must_use]
pub fn run_span(run: &PipelineRun) -> Span {
    tracing::info_span!(
        "pipeline_run",
        run_id = %run.run_id,
        pipeline = %run.pipeline_id,
        trigger = %run.trigger,
        mode = %run.mode,
    )
}

/// Span wrapping one stage attempt.
#[must_use]
pub fn attempt_span(stage_id: &str, attempt: u32) -> Span {
    tracing::debug_span!("stage_attempt", stage = %stage_id, attempt)
}
