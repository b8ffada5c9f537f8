//! Small helpers for run ids and timestamps.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Generates a new run id (UUID v7, so ids sort by creation time).
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Returns the current UTC time.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Milliseconds from `start` to `end`, floored at zero.
#[must_use]
pub fn elapsed_ms(start: Timestamp, end: Timestamp) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
