//! Operator-visible event recording.
//!
//! Failures an operator must act on (ownership collisions, failed
//! authorizations) are surfaced as events on the offending object. The
//! default sink writes them to the log; hosts wire their own recorder.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::store::Meta;

/// Event reasons emitted by the controllers.
pub const REASON_COLLIDING_SECRET: &str = "CollidingSecret";
pub const REASON_COLLIDING_EXPOSER: &str = "CollidingExposer";
pub const REASON_FAILED_AUTHORIZATION: &str = "AcmeFailedAuthorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// The object an event is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: &'static str, meta: &Meta) -> Self {
        Self {
            kind,
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }
}

/// Sink for operator-visible events.
pub trait EventSink: Send + Sync {
    fn record(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str);
}

/// Default sink: structured log lines.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                kind = object.kind,
                object = %format!("{}/{}", object.namespace, object.name),
                reason = reason,
                "{message}"
            ),
            EventType::Warning => warn!(
                kind = object.kind,
                object = %format!("{}/{}", object.namespace, object.name),
                reason = reason,
                "{message}"
            ),
        }
    }
}

/// A recorded event, as kept by [`RecordingEventSink`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: ObjectRef,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Sink that keeps events in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, object: &ObjectRef, event_type: EventType, reason: &str, message: &str) {
        let event = RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
