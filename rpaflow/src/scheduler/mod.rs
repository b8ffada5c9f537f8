//! Scheduling: cadence expressions and the timer service.

mod cadence;
mod service;

pub use cadence::{Cadence, CadenceError};
pub use service::{FireOutcome, FireReport, ScheduleStatus, SchedulerService};
