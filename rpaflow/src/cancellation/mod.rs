//! Cooperative cancellation utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation of runs and loops
//! - CleanupGuard for releasing resources when a task ends or panics

mod cleanup;
mod token;

pub use cleanup::CleanupGuard;
pub use token::CancellationToken;
