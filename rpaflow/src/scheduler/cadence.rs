//! Cadence expressions for scheduled runs.
//!
//! Supported forms:
//! - `every <N><s|m|h>`: fixed interval from the last fire
//! - `daily HH:MM`: once a day at a wall-clock time
//! - `weekly <mon..sun> HH:MM`: once a week
//!
//! Wall-clock times are interpreted in a fixed UTC offset supplied by the
//! caller.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static EVERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^every\s+(\d+)\s*([smh])$").expect("valid regex"));
static DAILY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^daily\s+(\d{1,2}):(\d{2})$").expect("valid regex"));
static WEEKLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^weekly\s+([a-z]+)\s+(\d{1,2}):(\d{2})$").expect("valid regex"));

/// Errors raised while parsing a cadence expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    /// The expression was blank.
    #[error("cadence expression is empty")]
    Empty,

    /// The expression matched none of the supported forms.
    #[error("unrecognized cadence '{0}' (expected 'every <N><s|m|h>', 'daily HH:MM' or 'weekly <day> HH:MM')")]
    Unrecognized(String),

    /// The interval was zero or too large.
    #[error("invalid interval in '{0}'")]
    InvalidInterval(String),

    /// The wall-clock time was out of range.
    #[error("invalid time of day in '{0}'")]
    InvalidTime(String),

    /// The weekday name was not recognized.
    #[error("invalid weekday '{0}'")]
    InvalidWeekday(String),
}

/// When a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Cadence {
    /// Fixed interval since the previous fire.
    Every(Duration),
    /// Every day at a local time.
    Daily {
        /// Local time of day.
        at: NaiveTime,
    },
    /// Every week on a day at a local time.
    Weekly {
        /// Day of the week.
        day: Weekday,
        /// Local time of day.
        at: NaiveTime,
    },
}

fn parse_time(expr: &str, hour: &str, minute: &str) -> Result<NaiveTime, CadenceError> {
    let hour: u32 = hour.parse().map_err(|_| CadenceError::InvalidTime(expr.to_string()))?;
    let minute: u32 = minute.parse().map_err(|_| CadenceError::InvalidTime(expr.to_string()))?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| CadenceError::InvalidTime(expr.to_string()))
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        if expr.is_empty() {
            return Err(CadenceError::Empty);
        }

        if let Some(caps) = EVERY_RE.captures(&expr) {
            let n: u64 = caps[1]
                .parse()
                .map_err(|_| CadenceError::InvalidInterval(expr.clone()))?;
            let unit = match &caps[2] {
                "h" => 3600,
                "m" => 60,
                _ => 1,
            };
            let secs = n
                .checked_mul(unit)
                .filter(|secs| *secs > 0)
                .ok_or_else(|| CadenceError::InvalidInterval(expr.clone()))?;
            return Ok(Self::Every(Duration::from_secs(secs)));
        }

        if let Some(caps) = DAILY_RE.captures(&expr) {
            let at = parse_time(&expr, &caps[1], &caps[2])?;
            return Ok(Self::Daily { at });
        }

        if let Some(caps) = WEEKLY_RE.captures(&expr) {
            let day = caps[1]
                .parse::<Weekday>()
                .map_err(|_| CadenceError::InvalidWeekday(caps[1].to_string()))?;
            let at = parse_time(&expr, &caps[2], &caps[3])?;
            return Ok(Self::Weekly { day, at });
        }

        Err(CadenceError::Unrecognized(s.trim().to_string()))
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => {
                let secs = interval.as_secs();
                if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
            Self::Daily { at } => write!(f, "daily {}", at.format("%H:%M")),
            Self::Weekly { day, at } => write!(
                f,
                "weekly {} {}",
                day.to_string().to_ascii_lowercase(),
                at.format("%H:%M")
            ),
        }
    }
}

impl TryFrom<String> for Cadence {
    type Error = CadenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cadence> for String {
    fn from(value: Cadence) -> Self {
        value.to_string()
    }
}

impl Cadence {
    /// The first fire time strictly after `after`.
    ///
    /// Wall-clock forms are evaluated in `offset`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        let (day, at) = match *self {
            Self::Every(interval) => {
                let step = ChronoDuration::from_std(interval)
                    .unwrap_or_else(|_| ChronoDuration::days(36_500));
                return after.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
            Self::Daily { at } => (None, at),
            Self::Weekly { day, at } => (Some(day), at),
        };

        let shift = ChronoDuration::seconds(i64::from(offset.local_minus_utc()));
        let local = after.naive_utc() + shift;
        let days_ahead = day.map_or(0, |d| {
            i64::from(
                (d.num_days_from_monday() + 7 - local.weekday().num_days_from_monday()) % 7,
            )
        });
        let mut candidate = (local.date() + ChronoDuration::days(days_ahead)).and_time(at);
        if candidate <= local {
            candidate += ChronoDuration::days(if day.is_some() { 7 } else { 1 });
        }
        DateTime::<Utc>::from_naive_utc_and_offset(candidate - shift, Utc)
    }
}
