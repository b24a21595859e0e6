//! Unified event bus — trait for emitting engine events from any module.
//!
//! Subsystems accept an `Arc<dyn EventSink>` to emit events toward
//! downstream observers (operator alerting, analytics). Notification
//! fan-out through the sink is best-effort; the suppression decision
//! itself never travels this path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    InstanceEnrolled,
    AttemptRecorded,
    StageAdvanced,
    InstanceCompleted,
    InstanceHalted,
    InstanceSuppressed,
    InstancePaused,
    InstanceResumed,
    ReplyClassified,
    IdentityDisabled,
    IdentityReenabled,
    GuardRejected,
    TickCompleted,
    DailyCapReached,
}

/// A single engine event. Free-form `detail` carries a normalized reason,
/// never raw provider payloads or message bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub tenant_id: String,
    pub instance_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for `EngineEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EngineEventType,
    tenant_id: impl Into<String>,
    instance_id: Option<Uuid>,
    detail: Option<String>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant_id: tenant_id.into(),
        instance_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let id = Uuid::new_v4();
        sink.emit(make_event(
            EngineEventType::AttemptRecorded,
            "acme",
            Some(id),
            None,
        ));
        sink.emit(make_event(
            EngineEventType::InstanceSuppressed,
            "acme",
            Some(id),
            Some("opt-out reply".into()),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EngineEventType::AttemptRecorded), 1);
        assert_eq!(sink.count_type(EngineEventType::InstanceSuppressed), 1);

        let events = sink.events();
        assert_eq!(events[0].tenant_id, "acme");
        assert_eq!(events[1].detail.as_deref(), Some("opt-out reply"));
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EngineEventType::TickCompleted, "acme", None, None));
    }
}
