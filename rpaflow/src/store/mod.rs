//! Durable run records.
//!
//! This module provides:
//! - The [`RunRepository`] capability and an in-memory implementation
//! - The local [`FallbackLog`] used while the primary is unreachable
//! - The [`ExecutionStore`] combining both with recovery and reconciliation

mod execution;
mod fallback;
mod repository;

pub use execution::{ExecutionStore, ReconcileReport, RunStats, SaveOutcome, StoreHealth};
pub use fallback::{FallbackLog, LogEntry};
pub use repository::{InMemoryRunRepository, RunQuery, RunRepository};
