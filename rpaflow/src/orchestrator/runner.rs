//! The run unit: drives one run from RUNNING to a terminal status.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use super::{Inner, CANCEL_REQUESTED};
use crate::cancellation::CancellationToken;
use crate::core::{
    AttemptError, AttemptStatus, FailureCause, NotificationEvent, PipelineRun, RunStatus, StageStatus,
};
use crate::errors::OrchestratorError;
use crate::observability::attempt_span;
use crate::pipeline::{PipelineDefinition, RetryDecision, StageDefinition, PANIC_ERROR_KIND, TIMEOUT_ERROR_KIND};
use crate::stages::{StageFailure, StageOutcome, StageParams, STAGE_OUTPUTS_KEY};
use crate::utils::now_utc;

/// Persistence budget ran out; the record was handed to the store queue.
struct Abandoned;

enum StageResult {
    Succeeded,
    Failed(FailureCause),
}

enum AttemptFailure {
    Failed(StageFailure),
    TimedOut(Duration),
}

impl AttemptFailure {
    fn kind(&self) -> &str {
        match self {
            Self::Failed(failure) => &failure.kind,
            Self::TimedOut(_) => TIMEOUT_ERROR_KIND,
        }
    }

    fn into_error(self, stage_id: &str, attempt: u32) -> OrchestratorError {
        match self {
            Self::Failed(failure) => OrchestratorError::StageExecution {
                stage_id: stage_id.to_string(),
                failure,
            },
            Self::TimedOut(timeout) => OrchestratorError::StageTimeout {
                stage_id: stage_id.to_string(),
                attempt,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        }
    }
}

pub(super) struct RunUnit {
    inner: Arc<Inner>,
    definition: PipelineDefinition,
    run: PipelineRun,
    token: Arc<CancellationToken>,
}

impl RunUnit {
    pub(super) fn new(
        inner: Arc<Inner>,
        definition: PipelineDefinition,
        run: PipelineRun,
        token: Arc<CancellationToken>,
    ) -> Self {
        Self {
            inner,
            definition,
            run,
            token,
        }
    }

    /// Runs every stage and returns the final record.
    pub(super) async fn execute(mut self) -> PipelineRun {
        let _ = self.drive().await;
        self.run
    }

    async fn drive(&mut self) -> Result<(), Abandoned> {
        self.notify(NotificationEvent::run_started(&self.run)).await;

        let stages = self.definition.stages.clone();
        let mut first_failure: Option<FailureCause> = None;

        for stage in &stages {
            if self.token.is_cancelled() {
                break;
            }
            if let StageResult::Failed(cause) = self.run_stage(stage).await? {
                first_failure.get_or_insert(cause);
                if self.definition.halts_after(stage) {
                    break;
                }
            }
        }

        if self.token.is_cancelled() {
            return self.finish_cancelled().await;
        }
        match first_failure {
            Some(cause) => self.finish_failed(cause).await,
            None => self.finish_succeeded().await,
        }
    }

    async fn run_stage(&mut self, stage: &StageDefinition) -> Result<StageResult, Abandoned> {
        let stage_id = stage.stage_id.as_str();
        let policy = &stage.retry;

        loop {
            let attempt = self.set_stage_status(stage_id, StageStatus::Attempting) + 1;
            self.persist().await?;

            let params = self.stage_params();
            let started_at = now_utc();
            let result = self
                .attempt(stage_id, params, policy.timeout())
                .instrument(attempt_span(stage_id, attempt))
                .await;
            let ended_at = now_utc();

            let failure = match result {
                Ok(outcome) => {
                    if let Some(record) = self.run.stage_mut(stage_id) {
                        record.record_attempt(AttemptStatus::Succeeded, started_at, ended_at, None);
                        record.status = StageStatus::Succeeded;
                        record.output = Some(outcome.data);
                    }
                    self.persist().await?;
                    info!(stage = %stage_id, attempt, "Stage succeeded");
                    self.notify_stage(stage_id, true).await;
                    return Ok(StageResult::Succeeded);
                }
                Err(failure) => failure,
            };

            let (status, message) = match &failure {
                AttemptFailure::Failed(f) => (AttemptStatus::Failed, f.message.clone()),
                AttemptFailure::TimedOut(t) => (
                    AttemptStatus::TimedOut,
                    format!("attempt timed out after {}ms", t.as_millis()),
                ),
            };
            let kind = failure.kind().to_string();
            if let Some(record) = self.run.stage_mut(stage_id) {
                record.record_attempt(
                    status,
                    started_at,
                    ended_at,
                    Some(AttemptError::new(kind.clone(), message.clone())),
                );
            }

            let decision = if self.token.is_cancelled() {
                RetryDecision::GiveUp
            } else {
                policy.decide(stage_id, attempt, &kind)
            };

            if let RetryDecision::Retry(delay) = decision {
                self.set_stage_status(stage_id, StageStatus::Retrying);
                self.persist().await?;
                warn!(
                    stage = %stage_id,
                    attempt,
                    error_kind = %kind,
                    error = %message,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Stage attempt failed, retrying"
                );
                if self.backoff(delay).await {
                    continue;
                }
            }

            self.set_stage_status(stage_id, StageStatus::Failed);
            self.persist().await?;
            warn!(
                stage = %stage_id,
                attempts = attempt,
                error_kind = %kind,
                error = %message,
                "Stage failed"
            );
            self.notify_stage(stage_id, false).await;
            let cause = FailureCause::from_error(&failure.into_error(stage_id, attempt));
            return Ok(StageResult::Failed(cause));
        }
    }

    /// Sleeps for the backoff delay. Returns false if cancelled meanwhile.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.token.cancelled() => {
                debug!("Backoff interrupted by cancellation");
                false
            }
        }
    }

    /// Runs one attempt on its own task so a panic surfaces as a failure.
    ///
    /// On timeout the task is detached, not aborted.
    async fn attempt(
        &self,
        stage_id: &str,
        params: StageParams,
        timeout: Option<Duration>,
    ) -> Result<StageOutcome, AttemptFailure> {
        let executor = Arc::clone(&self.inner.executor);
        let owned_id = stage_id.to_string();
        let handle = tokio::spawn(async move { executor.execute(&owned_id, params).await }.in_current_span());

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(AttemptFailure::TimedOut(limit)),
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(failure)) => Err(AttemptFailure::Failed(failure)),
            Err(join_error) => Err(AttemptFailure::Failed(StageFailure::new(
                PANIC_ERROR_KIND,
                join_error.to_string(),
            ))),
        }
    }

    /// Trigger parameters plus the outputs of earlier stages.
    fn stage_params(&self) -> StageParams {
        let mut params = self.run.parameters.clone();
        params.insert(
            STAGE_OUTPUTS_KEY.to_string(),
            Value::Object(self.run.stage_outputs()),
        );
        params
    }

    /// Sets a stage's status and returns its attempt count.
    fn set_stage_status(&mut self, stage_id: &str, status: StageStatus) -> u32 {
        self.run.stage_mut(stage_id).map_or(0, |record| {
            record.status = status;
            record.attempt_count()
        })
    }

    async fn finish_succeeded(&mut self) -> Result<(), Abandoned> {
        self.finish(RunStatus::Succeeded, None);
        self.persist().await?;
        info!(duration_ms = self.run.duration_ms(), "Run succeeded");
        self.notify(NotificationEvent::run_succeeded(&self.run)).await;
        Ok(())
    }

    async fn finish_failed(&mut self, cause: FailureCause) -> Result<(), Abandoned> {
        let skipped = self.run.skip_remaining();
        self.finish(RunStatus::Failed, Some(cause.clone()));
        self.persist().await?;
        warn!(
            error_kind = %cause.kind,
            failed_stage = cause.stage_id.as_deref().unwrap_or(""),
            skipped = skipped.len(),
            "Run failed"
        );
        self.notify(NotificationEvent::run_failed(&self.run, &cause, &skipped))
            .await;
        Ok(())
    }

    async fn finish_cancelled(&mut self) -> Result<(), Abandoned> {
        let reason = self
            .token
            .reason()
            .unwrap_or_else(|| CANCEL_REQUESTED.to_string());
        let skipped = self.run.skip_remaining();
        self.finish(RunStatus::Cancelled, None);
        self.persist().await?;
        info!(reason = %reason, skipped = skipped.len(), "Run cancelled");
        self.notify(NotificationEvent::run_cancelled(&self.run, &reason, &skipped))
            .await;
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, failure: Option<FailureCause>) {
        if let Err(e) = self.run.finish(status, failure, now_utc()) {
            error!(error = %e, "Illegal terminal transition");
        }
    }

    /// Saves the current record, retrying within the persistence budget.
    ///
    /// When the budget runs out the run is abandoned as FAILED/Interrupted
    /// and its record is queued in the store.
    async fn persist(&mut self) -> Result<(), Abandoned> {
        let budget = self.inner.persistence.persist_retry_budget;
        let delay = self.inner.persistence.retry_delay();
        let mut retries = 0;

        loop {
            match self.inner.store.save(&self.run).await {
                Ok(outcome) => {
                    self.run.degraded = outcome.is_degraded();
                    return Ok(());
                }
                Err(e) if retries < budget => {
                    retries += 1;
                    warn!(
                        status = %self.run.status,
                        retry = retries,
                        budget,
                        error = %e,
                        "Persisting run failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.abandon(&e);
                    return Err(Abandoned);
                }
            }
        }
    }

    fn abandon(&mut self, err: &OrchestratorError) {
        error!(status = %self.run.status, error = %err, "Persistence budget exhausted, abandoning run");
        for stage in &mut self.run.stages {
            if matches!(stage.status, StageStatus::Attempting | StageStatus::Retrying) {
                stage.status = StageStatus::Failed;
            }
        }
        self.run.skip_remaining();
        // forced: the run may already hold a terminal status it could not persist
        self.run.status = RunStatus::Failed;
        self.run.failure = Some(FailureCause::interrupted(format!(
            "persistence unavailable: {err}"
        )));
        self.run.ended_at = Some(now_utc().max(self.run.started_at));
        self.run.degraded = false;
        self.inner.store.enqueue_abandoned(self.run.clone());
    }

    async fn notify_stage(&self, stage_id: &str, succeeded: bool) {
        let Some(record) = self.run.stage(stage_id) else {
            return;
        };
        let event = if succeeded {
            NotificationEvent::stage_succeeded(&self.run, record)
        } else {
            NotificationEvent::stage_failed(&self.run, record)
        };
        self.notify(event).await;
    }

    async fn notify(&self, event: NotificationEvent) {
        self.inner.dispatcher.dispatch(event).await;
    }
}
