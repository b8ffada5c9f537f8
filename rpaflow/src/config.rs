//! Runtime configuration.
//!
//! Every numeric policy (attempts, deadlines, backoff, persistence budget,
//! scheduler tick) is configuration. Values come from [`Default`], builder
//! methods, or `RPAFLOW_*` environment variables via
//! [`OrchestratorConfig::from_env`].

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::errors::OrchestratorError;
use crate::pipeline::RetryPolicy;
use crate::scheduler::{Cadence, CadenceError};

const PREFIX: &str = "RPAFLOW_";
const SCHEDULE_PREFIX: &str = "RPAFLOW_SCHEDULE_";
const ENABLED_SUFFIX: &str = "_ENABLED";

/// Errors raised while reading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable held a value that could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// The variable name.
        key: String,
        /// The raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A schedule cadence could not be parsed.
    #[error("invalid cadence for {key}: {source}")]
    Cadence {
        /// The variable name.
        key: String,
        /// The parse error.
        source: CadenceError,
    },
}

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Settings for the execution store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the fallback log. `None` keeps the fallback in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_log: Option<PathBuf>,
    /// Extra save attempts a run makes when primary and fallback both fail.
    pub persist_retry_budget: u32,
    /// Delay between those attempts.
    pub persist_retry_delay_ms: u64,
    /// How often degraded records are re-saved to the primary.
    pub reconcile_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            fallback_log: None,
            persist_retry_budget: 3,
            persist_retry_delay_ms: 1000,
            reconcile_interval_secs: 60,
        }
    }
}

impl PersistenceConfig {
    /// Sets the fallback log path.
    #[must_use]
    pub fn with_fallback_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_log = Some(path.into());
        self
    }

    /// Sets the persistence retry budget.
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32, delay: Duration) -> Self {
        self.persist_retry_budget = budget;
        self.persist_retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Delay between persistence retries.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_delay_ms)
    }

    /// Reconcile loop interval.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

/// One schedule entry from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Pipeline to trigger.
    pub pipeline_id: String,
    /// When to trigger it.
    pub cadence: Cadence,
    /// Disabled schedules never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Parameters passed to each scheduled run.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleSpec {
    /// Creates an enabled schedule.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            cadence,
            enabled: true,
            parameters: Map::new(),
        }
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the run parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Settings for the scheduler service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-schedule checks.
    pub tick_secs: u64,
    /// Offset applied to `daily`/`weekly` wall-clock times.
    pub utc_offset_minutes: i32,
    /// Schedules registered at startup.
    #[serde(default)]
    pub schedules: Vec<ScheduleSpec>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            utc_offset_minutes: 0,
            schedules: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Tick interval.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    /// The configured offset, UTC when out of range.
    #[must_use]
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }

    /// Adds a schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedules.push(schedule);
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry policy applied to stages that do not carry their own.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Execution store settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let full = format!("{PREFIX}{key}");
    match vars.get(&full).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key: full.clone(),
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

impl OrchestratorConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the persistence settings.
    #[must_use]
    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Sets the scheduler settings.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Reads configuration from `(name, value)` pairs.
    ///
    /// Unset variables keep their defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with(PREFIX))
            .collect();
        let mut config = Self::default();

        if let Some(n) = parse_var::<u32>(&vars, "MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = parse_var::<f64>(&vars, "STAGE_TIMEOUT_SECS")? {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::Invalid {
                    key: format!("{PREFIX}STAGE_TIMEOUT_SECS"),
                    value: secs.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ms = (secs * 1000.0).round() as u64;
            config.retry.timeout_per_attempt_ms = Some(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64>(&vars, "BACKOFF_INITIAL_MS")? {
            config.retry.backoff_initial_ms = ms;
            config.retry.backoff_max_ms = config.retry.backoff_max_ms.max(ms);
        }
        if let Some(m) = parse_var::<f64>(&vars, "BACKOFF_MULTIPLIER")? {
            config.retry.backoff_multiplier = m;
        }
        if let Some(ms) = parse_var::<u64>(&vars, "BACKOFF_MAX_MS")? {
            config.retry.backoff_max_ms = ms;
        }
        if let Some(kinds) = vars.get(&format!("{PREFIX}RETRYABLE_KINDS")) {
            let kinds: Vec<&str> = kinds.split(',').map(str::trim).filter(|k| !k.is_empty()).collect();
            if !kinds.is_empty() {
                config.retry = config.retry.with_retryable_kinds(kinds);
            }
        }
        config
            .retry
            .validate()
            .map_err(|e| ConfigError::Invalid {
                key: format!("{PREFIX}MAX_ATTEMPTS/BACKOFF_*"),
                value: String::new(),
                reason: e.to_string(),
            })?;

        if let Some(path) = vars.get(&format!("{PREFIX}FALLBACK_LOG")).filter(|p| !p.trim().is_empty()) {
            config.persistence.fallback_log = Some(PathBuf::from(path.trim()));
        }
        if let Some(n) = parse_var::<u32>(&vars, "PERSIST_RETRY_BUDGET")? {
            config.persistence.persist_retry_budget = n;
        }
        if let Some(ms) = parse_var::<u64>(&vars, "PERSIST_RETRY_DELAY_MS")? {
            config.persistence.persist_retry_delay_ms = ms;
        }
        if let Some(secs) = parse_var::<u64>(&vars, "RECONCILE_INTERVAL_SECS")? {
            config.persistence.reconcile_interval_secs = secs;
        }

        if let Some(secs) = parse_var::<u64>(&vars, "SCHEDULER_TICK_SECS")? {
            config.scheduler.tick_secs = secs;
        }
        if let Some(minutes) = parse_var::<i32>(&vars, "UTC_OFFSET_MINUTES")? {
            if minutes.abs() >= 24 * 60 {
                return Err(ConfigError::Invalid {
                    key: format!("{PREFIX}UTC_OFFSET_MINUTES"),
                    value: minutes.to_string(),
                    reason: "must be within +/- 23:59".to_string(),
                });
            }
            config.scheduler.utc_offset_minutes = minutes;
        }
        config.scheduler.schedules = Self::schedules_from(&vars)?;

        Ok(config)
    }

    fn schedules_from(vars: &HashMap<String, String>) -> Result<Vec<ScheduleSpec>, ConfigError> {
        // sorted so schedules register in a stable order
        let mut schedules = BTreeMap::new();
        for (key, raw) in vars {
            let Some(name) = key.strip_prefix(SCHEDULE_PREFIX) else {
                continue;
            };
            if name.is_empty() || name.ends_with(ENABLED_SUFFIX) {
                continue;
            }
            let cadence = raw.parse::<Cadence>().map_err(|source| ConfigError::Cadence {
                key: key.clone(),
                source,
            })?;
            let enabled_key = format!("{key}{ENABLED_SUFFIX}");
            let enabled = match vars.get(&enabled_key) {
                Some(v) => parse_bool(&enabled_key, v)?,
                None => true,
            };
            schedules.insert(
                name.to_ascii_lowercase(),
                ScheduleSpec::new(name.to_ascii_lowercase(), cadence).with_enabled(enabled),
            );
        }
        Ok(schedules.into_values().collect())
    }
}
