//! Notification sinks and dispatch.
//!
//! The orchestrator emits a [`NotificationEvent`](crate::core::NotificationEvent)
//! at each lifecycle transition, after the transition is persisted. The
//! [`NotificationDispatcher`] forwards it to one [`NotificationSink`].

mod dispatcher;
mod sink;

pub use dispatcher::NotificationDispatcher;
#[cfg(test)]
pub use sink::MockNotificationSink;
pub use sink::{
    CollectingSink, DeduplicatingSink, FanOutSink, LoggingSink, NoOpSink, NotificationSink,
};
