//! Timer-driven triggering of registered pipelines.

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cadence::Cadence;
use crate::cancellation::CancellationToken;
use crate::config::{ScheduleSpec, SchedulerConfig};
use crate::core::{RunId, TriggerKind};
use crate::errors::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::utils::now_utc;

#[derive(Debug, Clone)]
struct ScheduleEntry {
    cadence: Cadence,
    enabled: bool,
    parameters: Map<String, Value>,
    /// Next fire is computed from here: registration, last fire or re-enable.
    anchor: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
}

/// Read-only view of one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    /// The scheduled pipeline.
    pub pipeline_id: String,
    /// Its cadence.
    pub cadence: Cadence,
    /// Whether the schedule fires.
    pub enabled: bool,
    /// When it last fired.
    pub last_fired: Option<DateTime<Utc>>,
    /// When it fires next; absent while disabled.
    pub next_fire: Option<DateTime<Utc>>,
}

/// Result of one scheduled fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// A run was started.
    Started(RunId),
    /// The pipeline was busy; the fire is dropped, not queued.
    Skipped {
        /// The run holding the pipeline, if known.
        active_run_id: Option<RunId>,
    },
    /// The orchestrator rejected the trigger.
    Failed(String),
}

/// One fire attempted during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireReport {
    /// The pipeline that was due.
    pub pipeline_id: String,
    /// What happened.
    pub outcome: FireOutcome,
}

/// Fires scheduled runs through the orchestrator, one schedule per pipeline.
pub struct SchedulerService {
    orchestrator: Orchestrator,
    entries: RwLock<BTreeMap<String, ScheduleEntry>>,
    tick: Duration,
    offset: FixedOffset,
    lifecycle: Mutex<Option<(Arc<CancellationToken>, JoinHandle<()>)>>,
}

impl std::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerService")
            .field("schedules", &self.entries.read().len())
            .field("tick", &self.tick)
            .field("offset", &self.offset)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SchedulerService {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, tick: Duration, offset: FixedOffset) -> Self {
        Self {
            orchestrator,
            entries: RwLock::new(BTreeMap::new()),
            tick,
            offset,
            lifecycle: Mutex::new(None),
        }
    }

    /// Creates a scheduler holding every schedule in `config`.
    pub fn from_config(orchestrator: Orchestrator, config: &SchedulerConfig) -> Result<Self, OrchestratorError> {
        let service = Self::new(orchestrator, config.tick(), config.utc_offset());
        let now = now_utc();
        for spec in &config.schedules {
            service.add_at(spec.clone(), now)?;
        }
        Ok(service)
    }

    /// Adds or replaces the schedule of a registered pipeline.
    pub fn add(&self, spec: ScheduleSpec) -> Result<(), OrchestratorError> {
        self.add_at(spec, now_utc())
    }

    /// Adds a schedule as if registered at `now`.
    pub fn add_at(&self, spec: ScheduleSpec, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        if self.orchestrator.definition(&spec.pipeline_id).is_none() {
            return Err(OrchestratorError::NotFound(format!(
                "pipeline '{}'",
                spec.pipeline_id
            )));
        }
        info!(
            pipeline = %spec.pipeline_id,
            cadence = %spec.cadence,
            enabled = spec.enabled,
            "Schedule registered"
        );
        self.entries.write().insert(
            spec.pipeline_id,
            ScheduleEntry {
                cadence: spec.cadence,
                enabled: spec.enabled,
                parameters: spec.parameters,
                anchor: now,
                last_fired: None,
            },
        );
        Ok(())
    }

    /// Removes a schedule. Returns false if there was none.
    pub fn remove(&self, pipeline_id: &str) -> bool {
        self.entries.write().remove(pipeline_id).is_some()
    }

    /// Enables a schedule; the next fire is computed from now.
    pub fn enable(&self, pipeline_id: &str) -> Result<(), OrchestratorError> {
        self.set_enabled(pipeline_id, true, now_utc())
    }

    /// Disables a schedule.
    pub fn disable(&self, pipeline_id: &str) -> Result<(), OrchestratorError> {
        self.set_enabled(pipeline_id, false, now_utc())
    }

    fn set_enabled(&self, pipeline_id: &str, enabled: bool, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(pipeline_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("schedule '{pipeline_id}'")))?;
        if enabled && !entry.enabled {
            entry.anchor = now;
        }
        entry.enabled = enabled;
        info!(pipeline = %pipeline_id, enabled, "Schedule toggled");
        Ok(())
    }

    /// Every schedule with its next fire time.
    #[must_use]
    pub fn status(&self) -> Vec<ScheduleStatus> {
        self.entries
            .read()
            .iter()
            .map(|(pipeline_id, entry)| ScheduleStatus {
                pipeline_id: pipeline_id.clone(),
                cadence: entry.cadence,
                enabled: entry.enabled,
                last_fired: entry.last_fired,
                next_fire: entry
                    .enabled
                    .then(|| entry.cadence.next_after(entry.anchor, self.offset)),
            })
            .collect()
    }

    /// Fires every enabled schedule that is due at `now`.
    ///
    /// A due schedule counts as fired even when the pipeline is busy.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<FireReport> {
        let due: Vec<(String, Map<String, Value>)> = {
            let mut entries = self.entries.write();
            let mut due = Vec::new();
            for (pipeline_id, entry) in entries.iter_mut().filter(|(_, entry)| entry.enabled) {
                let due_at = entry.cadence.next_after(entry.anchor, self.offset);
                if due_at > now {
                    continue;
                }
                // anchor on the slot, not the tick; missed slots collapse into this fire
                entry.anchor = if entry.cadence.next_after(due_at, self.offset) <= now {
                    now
                } else {
                    due_at
                };
                entry.last_fired = Some(now);
                due.push((pipeline_id.clone(), entry.parameters.clone()));
            }
            due
        };

        if due.is_empty() {
            return Vec::new();
        }
        debug!(due = due.len(), "Schedules due");

        let fires = due.into_iter().map(|(pipeline_id, parameters)| async move {
            let outcome = match self
                .orchestrator
                .trigger(&pipeline_id, parameters, TriggerKind::Scheduled)
                .await
            {
                Ok(run_id) => FireOutcome::Started(run_id),
                Err(OrchestratorError::AlreadyRunning { active_run_id, .. }) => {
                    info!(
                        pipeline = %pipeline_id,
                        active_run_id = ?active_run_id,
                        "Scheduled fire skipped, pipeline already running"
                    );
                    FireOutcome::Skipped { active_run_id }
                }
                Err(e) => {
                    warn!(pipeline = %pipeline_id, error = %e, "Scheduled fire failed");
                    FireOutcome::Failed(e.to_string())
                }
            };
            FireReport {
                pipeline_id,
                outcome,
            }
        });
        futures::future::join_all(fires).await
    }

    /// Returns true while the timer loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    /// Starts the timer loop. Returns false if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return false;
        }

        let token = Arc::new(CancellationToken::new());
        let service = Arc::clone(self);
        let stop = Arc::clone(&token);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = interval.tick() => {
                        service.tick(now_utc()).await;
                    }
                }
            }
            debug!("Scheduler loop exited");
        });

        info!(tick_secs = self.tick.as_secs(), "Scheduler started");
        *lifecycle = Some((token, handle));
        true
    }

    /// Stops the timer loop and waits for it to exit.
    ///
    /// Runs already started are not affected.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.lifecycle.lock().take() else {
            return;
        };
        token.cancel("scheduler stopped");
        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        info!("Scheduler stopped");
    }
}
