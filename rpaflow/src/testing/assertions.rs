//! Test assertions for run records and event streams.

use crate::core::{EventKind, NotificationEvent, PipelineRun, RunStatus, StageStatus};

/// Asserts the run's status.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {expected}, got {} (failure: {:?})",
        run.run_id, run.status, run.failure
    );
}

/// Asserts the status of every stage, in order.
pub fn assert_stage_statuses(run: &PipelineRun, expected: &[StageStatus]) {
    let actual: Vec<StageStatus> = run.stages.iter().map(|s| s.status).collect();
    assert_eq!(actual, expected, "Unexpected stage statuses");
}

/// Asserts that attempt numbers are contiguous from 1 and ordered in time.
pub fn assert_attempts_contiguous(run: &PipelineRun) {
    for stage in &run.stages {
        for (i, attempt) in stage.attempts.iter().enumerate() {
            assert_eq!(
                attempt.number as usize,
                i + 1,
                "Stage '{}' attempt numbers are not contiguous",
                stage.stage_id
            );
            assert!(attempt.ended_at >= attempt.started_at);
        }
        for pair in stage.attempts.windows(2) {
            assert!(
                pair[1].started_at >= pair[0].ended_at,
                "Stage '{}' attempts overlap",
                stage.stage_id
            );
        }
    }
}

/// Asserts the exact sequence of event kinds.
pub fn assert_event_kinds(events: &[NotificationEvent], expected: &[EventKind]) {
    let actual: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(actual, expected, "Unexpected event sequence");
}
