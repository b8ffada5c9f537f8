//! Notification dispatch at run transition points.

use std::sync::Arc;
use tracing::{debug, warn};

use super::sink::{NoOpSink, NotificationSink};
use crate::core::NotificationEvent;

/// Hands lifecycle events to the configured sink.
///
/// Delivery happens inline at the transition point. A failed delivery is
/// logged and swallowed: it never fails the run and never touches persisted
/// state.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher over `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Delivers `event`, returning whether the sink accepted it.
    pub async fn dispatch(&self, event: NotificationEvent) -> bool {
        match self.sink.notify(&event).await {
            Ok(()) => {
                debug!(
                    event_kind = %event.kind,
                    run_id = %event.run_id,
                    "Notification delivered"
                );
                true
            }
            Err(e) => {
                warn!(
                    event_kind = %event.kind,
                    run_id = %event.run_id,
                    pipeline = %event.pipeline_id,
                    sink = %e.sink,
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(NoOpSink))
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}
