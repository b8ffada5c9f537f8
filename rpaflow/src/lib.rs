//! # rpaflow
//!
//! Orchestration core for staged RPA pipelines.
//!
//! A pipeline is an ordered list of stages under one identity. rpaflow
//! drives each run through its stages with:
//!
//! - **Retries and timeouts**: per-stage attempt bounds, backoff and deadlines
//! - **Exclusivity**: at most one active run per pipeline identity
//! - **Durable records**: every transition persisted, with a degraded fallback
//!   while the primary store is down
//! - **Scheduling**: `every`, `daily` and `weekly` cadences plus manual triggers
//! - **Notifications**: lifecycle events with idempotency keys, delivered to
//!   an injected sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rpaflow::prelude::*;
//!
//! let store = Arc::new(ExecutionStore::in_memory(Arc::new(InMemoryRunRepository::new())));
//! let orchestrator = Orchestrator::builder(Arc::new(MyStages::new()), store)
//!     .with_sink(Arc::new(LoggingSink::default()))
//!     .with_definition(PipelineDefinition::uniform(
//!         "rpa_pipeline",
//!         ["collect_indices", "analyze_sheets", "erp_update", "bank_update"],
//!         &RetryPolicy::default().with_max_attempts(3),
//!     ))
//!     .build()?;
//!
//! let run_id = orchestrator.trigger("rpa_pipeline", Map::new(), TriggerKind::Manual).await?;
//! let run = orchestrator.wait(run_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{ApiResponse, PipelineApi, RunsQuery, TriggerRequest, TriggerStageRequest};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{OrchestratorConfig, PersistenceConfig, ScheduleSpec, SchedulerConfig};
    pub use crate::core::{
        EventKind, NotificationEvent, PipelineRun, RunId, RunMode, RunStatus, StageStatus,
        TriggerKind,
    };
    pub use crate::errors::{ErrorKind, OrchestratorError};
    pub use crate::events::{LoggingSink, NoOpSink, NotificationSink};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::pipeline::{PipelineDefinition, RetryPolicy, StageDefinition};
    pub use crate::scheduler::{Cadence, SchedulerService};
    pub use crate::stages::{StageExecutor, StageFailure, StageOutcome, StageParams, StageRouter};
    pub use crate::store::{ExecutionStore, InMemoryRunRepository, RunQuery, RunRepository};
    pub use serde_json::Map;
    pub use std::sync::Arc;
}
