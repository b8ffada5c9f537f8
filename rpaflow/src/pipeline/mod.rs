//! Pipeline definitions and retry policy.
//!
//! This module provides:
//! - Pipeline and stage definitions
//! - Retry policy with backoff and jitter

mod retry;
mod spec;

pub use retry::{JitterStrategy, RetryDecision, RetryPolicy, PANIC_ERROR_KIND, TIMEOUT_ERROR_KIND};
pub use spec::{PipelineDefinition, StageDefinition};
