//! Retry policy with exponential backoff and optional jitter.
//!
//! The policy is pure configuration plus a pure decision function: given the
//! stage, the attempt that just failed and its error kind, it says whether to
//! try again and how long to wait first.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::errors::OrchestratorError;

/// Error kind recorded for an attempt that hit its deadline.
pub const TIMEOUT_ERROR_KIND: &str = "timeout";

/// Error kind recorded for an executor task that panicked.
pub const PANIC_ERROR_KIND: &str = "panic";

/// Jitter applied on top of the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry configuration for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. At least 1.
    pub max_attempts: u32,
    /// Deadline for each attempt. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_per_attempt_ms: Option<u64>,
    /// Delay before the first retry.
    pub backoff_initial_ms: u64,
    /// Growth factor applied per retry.
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay.
    pub backoff_max_ms: u64,
    /// Error kinds that may be retried. `None` retries every kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_error_kinds: Option<BTreeSet<String>>,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            timeout_per_attempt_ms: None,
            backoff_initial_ms: 0,
            backoff_multiplier: 1.0,
            backoff_max_ms: 0,
            retryable_error_kinds: None,
            jitter: JitterStrategy::None,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

impl RetryDecision {
    /// Returns true if another attempt should be made.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

impl RetryPolicy {
    /// Creates the default policy: a single attempt, no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the backoff parameters.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.backoff_initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
        self.backoff_multiplier = multiplier;
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Restricts retries to the given error kinds.
    #[must_use]
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.retryable_error_kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// The per-attempt deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_per_attempt_ms.map(Duration::from_millis)
    }

    /// Checks that the policy is usable.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout_per_attempt_ms == Some(0) {
            return Err(OrchestratorError::Configuration(
                "timeout_per_attempt must be positive".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(OrchestratorError::Configuration(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(OrchestratorError::Configuration(format!(
                "backoff_max ({}ms) is below backoff_initial ({}ms)",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }
        Ok(())
    }

    /// Returns true if errors of `kind` may be retried.
    #[must_use]
    pub fn is_retryable(&self, kind: &str) -> bool {
        self.retryable_error_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(kind))
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    ///
    /// `backoff_initial * backoff_multiplier^(retry-1)`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.backoff_max_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = if capped.is_finite() && capped > 0.0 {
            capped as u64
        } else {
            0
        };
        Duration::from_millis(ms)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let jittered = match self.jitter {
            JitterStrategy::None => ms,
            JitterStrategy::Full => {
                if ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=ms)
                }
            }
            JitterStrategy::Equal => {
                let half = ms / 2;
                if half == 0 {
                    ms
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Decides what happens after `attempt` (1-based) of `stage_id` failed
    /// with `error_kind`.
    #[must_use]
    pub fn decide(&self, stage_id: &str, attempt: u32, error_kind: &str) -> RetryDecision {
        let decision = if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else if !self.is_retryable(error_kind) {
            RetryDecision::NotRetryable
        } else {
            RetryDecision::Retry(self.apply_jitter(self.backoff_delay(attempt)))
        };

        tracing::trace!(
            stage = %stage_id,
            attempt,
            error_kind = %error_kind,
            decision = ?decision,
            "Retry decision"
        );
        decision
    }
}
