//! Scripted stage executor for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::stages::{StageExecutor, StageFailure, StageOutcome, StageParams};

/// What a scripted stage does on one call.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Succeed with the given data.
    Succeed(Map<String, Value>),
    /// Fail with the given failure.
    Fail(StageFailure),
    /// Never return.
    Hang,
    /// Panic with the given message.
    Panic(String),
    /// Sleep, then succeed with no data.
    Delay(Duration),
    /// Wait for the notify, then succeed with no data.
    Gate(Arc<Notify>),
}

impl ScriptedResponse {
    /// Succeed with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Succeed(Map::new())
    }

    /// Succeed with a single key.
    #[must_use]
    pub fn ok_with(key: impl Into<String>, value: Value) -> Self {
        let mut data = Map::new();
        data.insert(key.into(), value);
        Self::Succeed(data)
    }

    /// Fail with the given kind and message.
    #[must_use]
    pub fn fail(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail(StageFailure::new(kind, message))
    }
}

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The stage that was invoked.
    pub stage_id: String,
    /// The parameters it received.
    pub params: StageParams,
}

/// A stage executor that plays back scripted responses per stage.
///
/// Each call pops the next response for the stage; the last one repeats.
/// Unscripted stages succeed with no data.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
    called: Notify,
}

impl ScriptedExecutor {
    /// Creates an executor where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the responses for a stage.
    #[must_use]
    pub fn with_script(
        self,
        stage_id: impl Into<String>,
        responses: impl IntoIterator<Item = ScriptedResponse>,
    ) -> Self {
        self.set_script(stage_id, responses);
        self
    }

    /// Replaces the responses for a stage.
    pub fn set_script(
        &self,
        stage_id: impl Into<String>,
        responses: impl IntoIterator<Item = ScriptedResponse>,
    ) {
        self.scripts
            .lock()
            .insert(stage_id.into(), responses.into_iter().collect());
    }

    /// Number of calls made for a stage.
    #[must_use]
    pub fn call_count(&self, stage_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stage_id == stage_id)
            .count()
    }

    /// Total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// All calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Waits until `stage_id` has been called at least `count` times.
    pub async fn wait_for_calls(&self, stage_id: &str, count: usize) {
        loop {
            let notified = self.called.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.call_count(stage_id) >= count {
                return;
            }
            notified.await;
        }
    }

    fn next_response(&self, stage_id: &str) -> ScriptedResponse {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(stage_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(ScriptedResponse::ok),
            Some(queue) => queue.front().cloned().unwrap_or_else(ScriptedResponse::ok),
            None => ScriptedResponse::ok(),
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, stage_id: &str, params: StageParams) -> Result<StageOutcome, StageFailure> {
        let response = self.next_response(stage_id);
        self.calls.lock().push(RecordedCall {
            stage_id: stage_id.to_string(),
            params,
        });
        self.called.notify_waiters();

        match response {
            ScriptedResponse::Succeed(data) => Ok(StageOutcome {
                data,
                message: None,
            }),
            ScriptedResponse::Fail(failure) => Err(failure),
            ScriptedResponse::Hang => futures::future::pending().await,
            ScriptedResponse::Panic(message) => panic!("{message}"),
            ScriptedResponse::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(StageOutcome::empty())
            }
            ScriptedResponse::Gate(gate) => {
                gate.notified().await;
                Ok(StageOutcome::empty())
            }
        }
    }
}
