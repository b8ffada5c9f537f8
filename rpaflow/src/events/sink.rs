//! Notification sink trait and implementations.

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, Level};

use crate::core::{EventKind, NotificationEvent};
use crate::errors::NotificationDeliveryError;

/// Capability that delivers lifecycle notifications.
///
/// Transports (e-mail, chat, webhooks) live outside this crate and implement
/// this trait. A failed delivery is reported, never retried by the core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers one event.
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationDeliveryError>;
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

#[async_trait]
impl NotificationSink for NoOpSink {
    async fn notify(&self, _event: &NotificationEvent) -> Result<(), NotificationDeliveryError> {
        Ok(())
    }
}

/// A sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingSink {
    /// Creates a new logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &NotificationEvent) {
        let stage = event.stage_id.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                event_kind = %event.kind,
                run_id = %event.run_id,
                pipeline = %event.pipeline_id,
                stage = %stage,
                payload = ?event.payload,
                "Notification: {}", event.kind
            );
        } else {
            info!(
                event_kind = %event.kind,
                run_id = %event.run_id,
                pipeline = %event.pipeline_id,
                stage = %stage,
                payload = ?event.payload,
                "Notification: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationDeliveryError> {
        self.log_event(event);
        Ok(())
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: RwLock<Vec<NotificationEvent>>,
}

impl CollectingSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.read().clone()
    }

    /// Returns the kinds of collected events, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<NotificationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationDeliveryError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}

/// Wraps a sink and drops events whose idempotency key was already delivered.
pub struct DeduplicatingSink {
    inner: Arc<dyn NotificationSink>,
    delivered: DashSet<String>,
}

impl DeduplicatingSink {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn NotificationSink>) -> Self {
        Self {
            inner,
            delivered: DashSet::new(),
        }
    }

    /// Number of distinct keys delivered so far.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

impl std::fmt::Debug for DeduplicatingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicatingSink")
            .field("delivered", &self.delivered.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSink for DeduplicatingSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationDeliveryError> {
        let fingerprint = event.idempotency_key().fingerprint();
        if !self.delivered.insert(fingerprint.clone()) {
            debug!(
                event_kind = %event.kind,
                run_id = %event.run_id,
                fingerprint = %fingerprint,
                "Dropping duplicate notification"
            );
            return Ok(());
        }

        let result = self.inner.notify(event).await;
        if result.is_err() {
            // not delivered, so a later copy must get through
            self.delivered.remove(&fingerprint);
        }
        result
    }
}

/// Delivers every event to several sinks.
///
/// All sinks are attempted; the first failure is reported.
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanOutSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanOutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl NotificationSink for FanOutSink {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationDeliveryError> {
        let results = futures::future::join_all(self.sinks.iter().map(|s| s.notify(event))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}
