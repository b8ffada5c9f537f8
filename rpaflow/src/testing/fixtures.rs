//! Test fixtures: the four-stage reference pipeline and a wired-up harness.

use std::sync::Arc;
use std::time::Duration;

use super::mocks::ScriptedExecutor;
use crate::config::PersistenceConfig;
use crate::events::{CollectingSink, FanOutSink, NotificationSink};
use crate::observability::init_test_tracing;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{PipelineDefinition, RetryPolicy};
use crate::store::{ExecutionStore, InMemoryRunRepository};

/// Pipeline identity of the reference pipeline.
pub const RPA_PIPELINE: &str = "rpa_pipeline";

/// Stage ids of the reference pipeline, in order.
pub const RPA_STAGES: [&str; 4] = ["collect_indices", "analyze_sheets", "erp_update", "bank_update"];

/// The reference pipeline with `policy` on every stage.
#[must_use]
pub fn rpa_pipeline(policy: &RetryPolicy) -> PipelineDefinition {
    PipelineDefinition::uniform(RPA_PIPELINE, RPA_STAGES, policy)
}

/// An orchestrator over an in-memory primary, with every event collected.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// Its execution store.
    pub store: Arc<ExecutionStore>,
    /// The primary repository behind the store.
    pub primary: Arc<InMemoryRunRepository>,
    /// Every delivered event.
    pub events: Arc<CollectingSink>,
    /// The scripted executor.
    pub executor: Arc<ScriptedExecutor>,
}

impl TestHarness {
    /// Builds a harness with `definition` registered.
    #[must_use]
    pub fn new(definition: PipelineDefinition, executor: ScriptedExecutor) -> Self {
        Self::build(definition, executor, None, Self::persistence())
    }

    /// Builds a harness that also delivers every event to `sink`.
    #[must_use]
    pub fn with_sink(
        definition: PipelineDefinition,
        executor: ScriptedExecutor,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::build(definition, executor, Some(sink), Self::persistence())
    }

    /// Builds a harness with custom persistence settings.
    #[must_use]
    pub fn with_persistence(
        definition: PipelineDefinition,
        executor: ScriptedExecutor,
        persistence: PersistenceConfig,
    ) -> Self {
        Self::build(definition, executor, None, persistence)
    }

    fn persistence() -> PersistenceConfig {
        PersistenceConfig::default().with_retry_budget(1, Duration::from_millis(10))
    }

    fn build(
        definition: PipelineDefinition,
        executor: ScriptedExecutor,
        sink: Option<Arc<dyn NotificationSink>>,
        persistence: PersistenceConfig,
    ) -> Self {
        init_test_tracing();
        let primary = Arc::new(InMemoryRunRepository::new());
        let store = Arc::new(ExecutionStore::in_memory(primary.clone()));
        let events = Arc::new(CollectingSink::new());
        let executor = Arc::new(executor);

        let mut fan_out = FanOutSink::new().with_sink(events.clone());
        if let Some(sink) = sink {
            fan_out = fan_out.with_sink(sink);
        }

        let orchestrator = Orchestrator::builder(executor.clone(), store.clone())
            .with_sink(Arc::new(fan_out))
            .with_definition(definition)
            .with_persistence(persistence)
            .build()
            .expect("valid test pipeline definition");

        Self {
            orchestrator,
            store,
            primary,
            events,
            executor,
        }
    }
}
