//! End-to-end tests: orchestrator, store, scheduler and sinks together.

use chrono::{FixedOffset, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::Orchestrator;
use crate::cancellation::CancellationToken;
use crate::config::{OrchestratorConfig, PersistenceConfig, ScheduleSpec};
use crate::core::{AttemptStatus, EventKind, PipelineRun, RunId, RunMode, RunStatus, StageStatus, TriggerKind};
use crate::errors::{ErrorKind, NotificationDeliveryError, OrchestratorError};
use crate::events::{CollectingSink, DeduplicatingSink, MockNotificationSink, NotificationSink};
use crate::pipeline::{PipelineDefinition, RetryPolicy, StageDefinition};
use crate::scheduler::{FireOutcome, SchedulerService};
use crate::store::{ExecutionStore, FallbackLog, InMemoryRunRepository, RunQuery, RunRepository};
use crate::testing::{
    assert_attempts_contiguous, assert_event_kinds, assert_run_status, assert_stage_statuses,
    rpa_pipeline, ScriptedExecutor, ScriptedResponse, TestHarness, RPA_PIPELINE, RPA_STAGES,
};
use crate::utils::generate_run_id;

const A: &str = RPA_STAGES[0];
const B: &str = RPA_STAGES[1];
const C: &str = RPA_STAGES[2];
const D: &str = RPA_STAGES[3];

/// The reference pipeline with `special` replacing the default for one stage.
fn pipeline_with(special: StageDefinition) -> PipelineDefinition {
    RPA_STAGES.iter().fold(PipelineDefinition::new(RPA_PIPELINE), |def, id| {
        if *id == special.stage_id {
            def.stage(special.clone())
        } else {
            def.stage(StageDefinition::new(*id))
        }
    })
}

fn single_attempt() -> PipelineDefinition {
    rpa_pipeline(&RetryPolicy::default())
}

async fn run_to_end(harness: &TestHarness) -> PipelineRun {
    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    harness.orchestrator.wait(run_id).await.unwrap()
}

async fn wait_for_stage_status(harness: &TestHarness, run_id: RunId, stage: &str, status: StageStatus) {
    for _ in 0..500 {
        let run = harness.orchestrator.get_run(run_id).await.unwrap();
        if run.stage(stage).map(|s| s.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stage {stage} never reached {status:?}");
}

#[tokio::test]
async fn test_all_stages_succeed() {
    let harness = TestHarness::new(single_attempt(), ScriptedExecutor::new());
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.mode, RunMode::Full);
    assert!(run.ended_at.is_some());
    assert!(run.failure.is_none());
    assert_stage_statuses(&run, &[StageStatus::Succeeded; 4]);
    for stage in &run.stages {
        assert_eq!(stage.attempts.len(), 1);
        assert_eq!(stage.attempts[0].number, 1);
        assert_eq!(stage.attempts[0].status, AttemptStatus::Succeeded);
    }

    assert_event_kinds(
        &harness.events.events(),
        &[
            EventKind::RunStarted,
            EventKind::StageSucceeded,
            EventKind::StageSucceeded,
            EventKind::StageSucceeded,
            EventKind::StageSucceeded,
            EventKind::RunSucceeded,
        ],
    );

    // the stored record matches what wait returned
    assert_eq!(harness.primary.peek(run.run_id), Some(run));
}

#[tokio::test]
async fn test_stage_retried_until_success() {
    let definition = pipeline_with(
        StageDefinition::new(B).with_retry(RetryPolicy::default().with_max_attempts(3)),
    );
    let executor = ScriptedExecutor::new().with_script(
        B,
        [
            ScriptedResponse::fail("transient", "portal returned 503"),
            ScriptedResponse::fail("transient", "portal returned 503"),
            ScriptedResponse::ok(),
        ],
    );
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Succeeded);
    assert_attempts_contiguous(&run);
    let statuses: Vec<AttemptStatus> = run.stage(B).unwrap().attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![AttemptStatus::Failed, AttemptStatus::Failed, AttemptStatus::Succeeded]
    );
    assert_eq!(run.stage(B).unwrap().attempts[0].error.as_ref().unwrap().kind, "transient");
    assert_eq!(harness.executor.call_count(C), 1);
    assert_eq!(harness.executor.call_count(D), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_run_and_skips_rest() {
    let definition = pipeline_with(
        StageDefinition::new(C).with_retry(RetryPolicy::default().with_timeout(Duration::from_secs(5))),
    );
    let executor = ScriptedExecutor::new().with_script(C, [ScriptedResponse::Hang]);
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Failed);
    assert_stage_statuses(
        &run,
        &[
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Skipped,
        ],
    );
    let attempt = &run.stage(C).unwrap().attempts[0];
    assert_eq!(attempt.status, AttemptStatus::TimedOut);
    assert_eq!(attempt.error.as_ref().unwrap().kind, "timeout");

    let failure = run.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::StageTimeout);
    assert_eq!(failure.stage_id.as_deref(), Some(C));
    assert_eq!(harness.executor.call_count(D), 0);

    let failed = harness.events.events_of_kind(EventKind::RunFailed);
    assert_eq!(failed[0].payload["skipped"], json!([D]));
    assert_eq!(failed[0].payload["error_kind"], json!("stage_timeout"));
    let stage_failed = harness.events.events_of_kind(EventKind::StageFailed);
    assert_eq!(stage_failed[0].payload["timed_out"], json!(true));
}

#[tokio::test]
async fn test_scheduled_fire_skipped_while_manual_run_active() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);
    let scheduler = SchedulerService::new(
        harness.orchestrator.clone(),
        Duration::from_secs(30),
        FixedOffset::east_opt(0).unwrap(),
    );
    let registered = Utc::now();
    scheduler
        .add_at(ScheduleSpec::new(RPA_PIPELINE, "every 1m".parse().unwrap()), registered)
        .unwrap();

    let manual = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();

    let reports = scheduler.tick(registered + chrono::Duration::minutes(1)).await;
    assert_eq!(
        reports[0].outcome,
        FireOutcome::Skipped {
            active_run_id: Some(manual)
        }
    );
    assert!(harness.store.exists_active(RPA_PIPELINE));
    assert_eq!(harness.store.active_runs(RPA_PIPELINE), vec![manual]);

    gate.notify_one();
    let run = harness.orchestrator.wait(manual).await.unwrap();
    assert_eq!(run.trigger, TriggerKind::Manual);
    assert_eq!(harness.orchestrator.list_runs(&RunQuery::all()).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_while_stage_executing() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(B, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);

    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    harness.executor.wait_for_calls(B, 1).await;

    harness.orchestrator.cancel(run_id).await.unwrap();
    // still waiting on B's attempt
    assert!(harness.orchestrator.is_active(run_id));

    gate.notify_one();
    let run = harness.orchestrator.wait(run_id).await.unwrap();

    assert_run_status(&run, RunStatus::Cancelled);
    assert_stage_statuses(
        &run,
        &[
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Skipped,
            StageStatus::Skipped,
        ],
    );
    assert_eq!(harness.executor.call_count(C), 0);

    let cancelled = harness.events.events_of_kind(EventKind::RunCancelled);
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].payload["skipped"], json!([C, D]));
    assert_eq!(
        harness.events.kinds().last(),
        Some(&EventKind::RunCancelled)
    );
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let definition = pipeline_with(StageDefinition::new(B).with_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_secs(60), 1.0, Duration::from_secs(60)),
    ));
    let executor = ScriptedExecutor::new().with_script(B, [ScriptedResponse::fail("transient", "down")]);
    let harness = TestHarness::new(definition, executor);

    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    wait_for_stage_status(&harness, run_id, B, StageStatus::Retrying).await;

    harness.orchestrator.cancel(run_id).await.unwrap();
    let run = harness.orchestrator.wait(run_id).await.unwrap();

    assert_run_status(&run, RunStatus::Cancelled);
    assert_eq!(run.stage(B).unwrap().attempts.len(), 1);
    assert_eq!(run.stage(B).unwrap().status, StageStatus::Failed);
    assert_eq!(run.stage(C).unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_degraded_save_and_reconcile() {
    let harness = TestHarness::new(single_attempt(), ScriptedExecutor::new());
    harness.primary.set_available(false);

    let run = run_to_end(&harness).await;
    assert_run_status(&run, RunStatus::Succeeded);
    assert!(run.degraded);
    assert!(harness.primary.is_empty());

    let fetched = harness.orchestrator.get_run(run.run_id).await.unwrap();
    assert!(fetched.degraded);
    assert_eq!(fetched.status, RunStatus::Succeeded);

    harness.primary.set_available(true);
    let report = harness.store.reconcile().await;
    assert_eq!(report.resaved, 1);
    assert_eq!(report.remaining, 0);

    let fetched = harness.orchestrator.get_run(run.run_id).await.unwrap();
    assert!(!fetched.degraded);
    assert_eq!(harness.primary.peek(run.run_id).map(|r| r.status), Some(RunStatus::Succeeded));
}

#[tokio::test]
async fn test_exclusive_full_runs() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);

    let first = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let err = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Scheduled)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AlreadyRunning { active_run_id: Some(id), .. } if id == first
    ));

    gate.notify_one();
    harness.orchestrator.wait(first).await.unwrap();

    // released once the first run finished
    let second = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    gate.notify_one();
    harness.orchestrator.wait(second).await.unwrap();
}

#[tokio::test]
async fn test_trigger_stage_rejected_during_full_run() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);

    let full = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let err = harness
        .orchestrator
        .trigger_stage(RPA_PIPELINE, C, Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err();
    assert!(err.is_already_running());

    gate.notify_one();
    harness.orchestrator.wait(full).await.unwrap();
}

#[tokio::test]
async fn test_single_stage_runs() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(C, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);
    let orchestrator = &harness.orchestrator;

    let erp = orchestrator
        .trigger_stage(RPA_PIPELINE, C, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();

    // same stage again and a full run both conflict
    assert!(orchestrator
        .trigger_stage(RPA_PIPELINE, C, Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err()
        .is_already_running());
    assert!(orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err()
        .is_already_running());

    // a different stage may overlap
    let bank = orchestrator
        .trigger_stage(RPA_PIPELINE, D, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let bank_run = orchestrator.wait(bank).await.unwrap();
    assert_run_status(&bank_run, RunStatus::Succeeded);
    assert_eq!(bank_run.mode, RunMode::SingleStage);
    assert_eq!(bank_run.stage_ids(), vec![D.to_string()]);

    gate.notify_one();
    let erp_run = orchestrator.wait(erp).await.unwrap();
    assert_run_status(&erp_run, RunStatus::Succeeded);
    assert_eq!(harness.executor.call_count(A), 0);

    let err = orchestrator
        .trigger_stage(RPA_PIPELINE, "missing", Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_max_attempts_one_never_retries() {
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::fail("transient", "boom")]);
    let harness = TestHarness::new(single_attempt(), executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Failed);
    assert_eq!(harness.executor.call_count(A), 1);
    assert_eq!(harness.executor.total_calls(), 1);
}

#[tokio::test]
async fn test_retries_bounded_by_max_attempts() {
    let definition = rpa_pipeline(&RetryPolicy::default().with_max_attempts(3));
    let executor = ScriptedExecutor::new().with_script(B, [ScriptedResponse::fail("transient", "still down")]);
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Failed);
    assert_attempts_contiguous(&run);
    assert_eq!(run.stage(B).unwrap().attempt_count(), 3);
    assert_eq!(harness.executor.call_count(B), 3);

    let failure = run.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::StageExecution);
    assert_eq!(failure.detail_kind.as_deref(), Some("transient"));
}

#[tokio::test]
async fn test_non_retryable_kind_fails_immediately() {
    let definition = rpa_pipeline(
        &RetryPolicy::default()
            .with_max_attempts(5)
            .with_retryable_kinds(["transient"]),
    );
    let executor =
        ScriptedExecutor::new().with_script(B, [ScriptedResponse::fail("configuration", "bad credentials")]);
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    assert_eq!(run.stage(B).unwrap().attempt_count(), 1);
    let failed = harness.events.events_of_kind(EventKind::RunFailed);
    assert_eq!(failed[0].payload["error_detail_kind"], json!("configuration"));
    assert_eq!(failed[0].payload["failed_stage"], json!(B));
    assert_eq!(failed[0].payload["skipped"], json!([C, D]));
}

#[tokio::test]
async fn test_continue_on_failure_runs_later_stages() {
    let definition = pipeline_with(StageDefinition::new(B).continue_on_failure());
    let executor = ScriptedExecutor::new().with_script(B, [ScriptedResponse::fail("parse", "bad sheet")]);
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Failed);
    assert_stage_statuses(
        &run,
        &[
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Succeeded,
            StageStatus::Succeeded,
        ],
    );
    assert_eq!(run.failure.unwrap().stage_id.as_deref(), Some(B));
}

#[tokio::test]
async fn test_panicking_stage_becomes_failure() {
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Panic("driver crashed".into())]);
    let harness = TestHarness::new(single_attempt(), executor);
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Failed);
    assert_eq!(run.failure.unwrap().detail_kind.as_deref(), Some("panic"));
}

#[tokio::test]
async fn test_stage_outputs_flow_downstream() {
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::ok_with("indices", json!([1, 2]))]);
    let harness = TestHarness::new(single_attempt(), executor);
    let mut params = Map::new();
    params.insert("period".into(), json!("2024-05"));

    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, params, TriggerKind::Manual)
        .await
        .unwrap();
    let run = harness.orchestrator.wait(run_id).await.unwrap();

    let calls = harness.executor.calls();
    assert_eq!(calls[0].params["stages"], json!({}));
    assert_eq!(calls[1].stage_id, B);
    assert_eq!(calls[1].params["period"], json!("2024-05"));
    assert_eq!(calls[1].params["stages"][A]["indices"], json!([1, 2]));
    assert_eq!(run.stage(A).unwrap().output.as_ref().unwrap()["indices"], json!([1, 2]));

    let succeeded = harness.events.events_of_kind(EventKind::StageSucceeded);
    assert_eq!(succeeded[0].payload["output_keys"], json!(["indices"]));
}

#[tokio::test]
async fn test_run_duration_covers_attempts() {
    let definition = rpa_pipeline(&RetryPolicy::default().with_max_attempts(2));
    let executor = ScriptedExecutor::new()
        .with_script(A, [ScriptedResponse::Delay(Duration::from_millis(20))])
        .with_script(
            B,
            [
                ScriptedResponse::fail("transient", "retry me"),
                ScriptedResponse::Delay(Duration::from_millis(10)),
            ],
        );
    let harness = TestHarness::new(definition, executor);
    let run = run_to_end(&harness).await;

    let attempts: u64 = run.stages.iter().map(|s| s.total_attempt_ms()).sum();
    assert!(run.duration_ms().unwrap() >= attempts);
    assert!(run.ended_at.unwrap() >= run.started_at);
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_run() {
    let mut sink = MockNotificationSink::new();
    sink.expect_notify()
        .times(6)
        .returning(|_| Err(NotificationDeliveryError::new("chat", "webhook unreachable")));

    let harness = TestHarness::with_sink(single_attempt(), ScriptedExecutor::new(), Arc::new(sink));
    let run = run_to_end(&harness).await;

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(harness.primary.peek(run.run_id).map(|r| r.status), Some(RunStatus::Succeeded));
    assert_eq!(harness.events.len(), 6);
}

#[tokio::test]
async fn test_deduplicating_sink_sees_unique_keys() {
    let collected = Arc::new(CollectingSink::new());
    let dedup = Arc::new(DeduplicatingSink::new(collected.clone()));
    let harness = TestHarness::with_sink(single_attempt(), ScriptedExecutor::new(), dedup.clone());
    let run = run_to_end(&harness).await;

    assert_eq!(dedup.delivered_count(), 6);
    let mut fingerprints: Vec<String> = collected
        .events()
        .iter()
        .map(|e| e.idempotency_key().fingerprint())
        .collect();
    fingerprints.sort();
    fingerprints.dedup();
    assert_eq!(fingerprints.len(), 6);

    // redelivering a logical event is dropped
    let replay = harness.events.events()[0].clone();
    dedup.notify(&replay).await.unwrap();
    assert_eq!(collected.len(), 6);
    assert_eq!(replay.run_id, run.run_id);
}

#[tokio::test]
async fn test_cancel_and_wait_errors() {
    let harness = TestHarness::new(single_attempt(), ScriptedExecutor::new());
    let unknown = generate_run_id();
    assert_eq!(
        harness.orchestrator.cancel(unknown).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        harness.orchestrator.wait(unknown).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let run = run_to_end(&harness).await;
    assert_eq!(
        harness.orchestrator.cancel(run.run_id).await.unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    // waiting on a finished run returns the stored record
    assert_eq!(harness.orchestrator.wait(run.run_id).await.unwrap(), run);
}

#[tokio::test]
async fn test_recover_interrupts_leftover_runs() {
    let primary = Arc::new(InMemoryRunRepository::new());
    let mut leftover = PipelineRun::new(
        generate_run_id(),
        RPA_PIPELINE,
        TriggerKind::Scheduled,
        RunMode::Full,
        RPA_STAGES,
        Map::new(),
        Utc::now(),
    );
    leftover.transition(RunStatus::Running).unwrap();
    leftover.stage_mut(A).unwrap().status = StageStatus::Succeeded;
    leftover.stage_mut(B).unwrap().status = StageStatus::Attempting;
    primary.put(&leftover).await.unwrap();

    let store = Arc::new(ExecutionStore::in_memory(primary.clone()));
    let orchestrator = Orchestrator::builder(Arc::new(ScriptedExecutor::new()), store.clone())
        .with_definition(single_attempt())
        .build()
        .unwrap();

    assert_eq!(orchestrator.recover().await.unwrap(), vec![leftover.run_id]);
    let recovered = orchestrator.get_run(leftover.run_id).await.unwrap();
    assert_run_status(&recovered, RunStatus::Failed);
    assert_eq!(recovered.failure.as_ref().unwrap().kind, ErrorKind::Interrupted);
    assert_stage_statuses(
        &recovered,
        &[
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped,
        ],
    );
    assert!(!store.exists_active(RPA_PIPELINE));

    let run_id = orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    assert_run_status(&orchestrator.wait(run_id).await.unwrap(), RunStatus::Succeeded);
}

#[tokio::test]
async fn test_recover_skips_runs_in_flight() {
    let gate = Arc::new(Notify::new());
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Gate(gate.clone())]);
    let harness = TestHarness::new(single_attempt(), executor);
    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    harness.executor.wait_for_calls(A, 1).await;

    assert!(harness.orchestrator.recover().await.unwrap().is_empty());
    assert!(harness.store.exists_active(RPA_PIPELINE));
    assert_eq!(
        harness.orchestrator.get_run(run_id).await.unwrap().status,
        RunStatus::Running
    );

    gate.notify_one();
    assert_run_status(&harness.orchestrator.wait(run_id).await.unwrap(), RunStatus::Succeeded);
}

#[tokio::test]
async fn test_persistence_budget_abandons_run() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(InMemoryRunRepository::new());
    // the fallback directory does not exist, so the fallback cannot write
    let fallback = FallbackLog::open(dir.path().join("missing").join("fallback.jsonl")).unwrap();
    let store = Arc::new(ExecutionStore::new(primary.clone(), fallback));
    let events = Arc::new(CollectingSink::new());
    let gate = Arc::new(Notify::new());
    let executor = Arc::new(ScriptedExecutor::new().with_script(A, [ScriptedResponse::Gate(gate.clone())]));

    let orchestrator = Orchestrator::builder(executor.clone(), store.clone())
        .with_sink(events.clone())
        .with_definition(single_attempt())
        .with_persistence(PersistenceConfig::default().with_retry_budget(2, Duration::from_millis(5)))
        .build()
        .unwrap();

    let abandoned = orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    executor.wait_for_calls(A, 1).await;
    primary.set_available(false);
    gate.notify_one();

    let run = orchestrator.wait(abandoned).await.unwrap();
    assert_run_status(&run, RunStatus::Failed);
    assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Interrupted);
    assert_eq!(run.stage(B).unwrap().status, StageStatus::Skipped);
    assert_eq!(executor.call_count(B), 0);
    assert_event_kinds(&events.events(), &[EventKind::RunStarted]);

    // served from the queue while nothing can be written
    assert_eq!(store.get(abandoned).await.map(|r| r.status), Some(RunStatus::Failed));
    assert_eq!(store.health().await.pending_records, 1);

    primary.set_available(true);
    let next = orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    gate.notify_one();
    orchestrator.wait(next).await.unwrap();

    assert_eq!(primary.peek(abandoned).map(|r| r.status), Some(RunStatus::Failed));
    assert_eq!(store.health().await.pending_records, 0);
}

#[tokio::test]
async fn test_start_rejects_invalid_definition() {
    let harness = TestHarness::new(single_attempt(), ScriptedExecutor::new());
    let empty = PipelineDefinition::new("empty");
    let err = harness
        .orchestrator
        .start(&empty, Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = harness
        .orchestrator
        .trigger("unregistered", Map::new(), TriggerKind::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_start_with_ad_hoc_definition() {
    let harness = TestHarness::new(single_attempt(), ScriptedExecutor::new());
    let definition = PipelineDefinition::uniform("adhoc", ["only"], &RetryPolicy::default());
    let run_id = harness
        .orchestrator
        .start(&definition, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let run = harness.orchestrator.wait(run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.pipeline_id, "adhoc");
    assert!(harness.orchestrator.definition("adhoc").is_none());

    harness.orchestrator.register(definition).unwrap();
    assert_eq!(harness.orchestrator.pipelines(), vec!["adhoc".to_string(), RPA_PIPELINE.to_string()]);
    let run_id = harness
        .orchestrator
        .trigger("adhoc", Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    assert_run_status(&harness.orchestrator.wait(run_id).await.unwrap(), RunStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_active_runs() {
    let executor = ScriptedExecutor::new().with_script(A, [ScriptedResponse::Delay(Duration::from_secs(30))]);
    let harness = TestHarness::new(single_attempt(), executor);
    let run_id = harness
        .orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    harness.executor.wait_for_calls(A, 1).await;

    let finished = harness.orchestrator.shutdown().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].run_id, run_id);
    assert_run_status(&finished[0], RunStatus::Cancelled);
    assert!(harness.orchestrator.active_runs().is_empty());

    let cancelled = harness.events.events_of_kind(EventKind::RunCancelled);
    assert_eq!(cancelled[0].payload["reason"], json!(super::SHUTDOWN_REQUESTED));
}

#[tokio::test]
async fn test_wiring_from_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("fallback.jsonl");
    let config = OrchestratorConfig::from_vars([
        ("RPAFLOW_MAX_ATTEMPTS", "2".to_string()),
        ("RPAFLOW_FALLBACK_LOG", log_path.display().to_string()),
        ("RPAFLOW_PERSIST_RETRY_BUDGET", "0".to_string()),
        ("RPAFLOW_SCHEDULE_RPA_PIPELINE", "daily 08:00".to_string()),
        ("RPAFLOW_SCHEDULE_RPA_PIPELINE_ENABLED", "false".to_string()),
    ])
    .unwrap();

    let primary = Arc::new(InMemoryRunRepository::new());
    let store = Arc::new(ExecutionStore::open(primary.clone(), &config.persistence).await.unwrap());
    let executor = Arc::new(
        ScriptedExecutor::new().with_script(A, [ScriptedResponse::fail("transient", "flaky"), ScriptedResponse::ok()]),
    );
    let orchestrator = Orchestrator::builder(executor.clone(), store.clone())
        .with_config(&config)
        .with_definition(rpa_pipeline(&config.retry))
        .build()
        .unwrap();

    let scheduler = SchedulerService::from_config(orchestrator.clone(), &config.scheduler).unwrap();
    let status = scheduler.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].pipeline_id, RPA_PIPELINE);
    assert!(!status[0].enabled);

    // degraded while the primary is down, reconciled by the background loop
    primary.set_available(false);
    let run_id = orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let run = orchestrator.wait(run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.stage(A).unwrap().attempt_count(), 2);
    assert!(run.degraded);
    assert!(log_path.exists());

    primary.set_available(true);
    let stop = Arc::new(CancellationToken::new());
    let handle = store.spawn_reconcile_loop(Duration::from_millis(10), stop.clone());
    for _ in 0..200 {
        if primary.peek(run_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop.cancel("test finished");
    handle.await.unwrap();

    assert_eq!(primary.peek(run_id).map(|r| r.degraded), Some(false));
    assert_eq!(store.health().await.degraded_records, 0);
}

#[tokio::test]
async fn test_router_backed_pipeline() {
    use crate::stages::{FnStageExecutor, StageFailure, StageOutcome, StageParams, StageRouter};

    let indices = Arc::new(FnStageExecutor::new(|_stage, _params: StageParams| async {
        Ok::<_, StageFailure>(StageOutcome::empty().with_data("indices", json!(["IPCA", "IGPM"])))
    }));
    let sheets = Arc::new(FnStageExecutor::new(|_stage, params: StageParams| async move {
        let count = params["stages"][A]["indices"].as_array().map_or(0, Vec::len);
        Ok::<_, StageFailure>(StageOutcome::empty().with_data("sheets", json!(count)))
    }));
    let router = StageRouter::new().route(A, indices).route(B, sheets);

    let store = Arc::new(ExecutionStore::in_memory(Arc::new(InMemoryRunRepository::new())));
    let orchestrator = Orchestrator::builder(Arc::new(router), store)
        .with_definition(single_attempt())
        .build()
        .unwrap();

    let run_id = orchestrator
        .trigger(RPA_PIPELINE, Map::new(), TriggerKind::Manual)
        .await
        .unwrap();
    let run = orchestrator.wait(run_id).await.unwrap();

    assert_eq!(run.stage(B).unwrap().output.as_ref().unwrap()["sheets"], json!(2));
    // erp_update has no route
    let failure = run.failure.unwrap();
    assert_eq!(failure.stage_id.as_deref(), Some(C));
    assert_eq!(failure.detail_kind.as_deref(), Some("unknown_stage"));
}
