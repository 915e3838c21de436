//! Operator-visible test notifications
//!
//! Every activation, marker detection, completion and failure is emitted as
//! an individual [`TestEvent`], synchronously on the dispatcher thread, so an
//! operator following live output can track progress line by line.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Notification emitted by the dispatcher or the active test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestEvent {
    /// A test claimed the line stream
    Activated {
        /// Test name
        test: String,
        /// Triggering line
        seq: u64,
    },
    /// A required marker was observed for the first time since activation
    MarkerDetected {
        /// Test name
        test: String,
        /// Marker text
        marker: String,
        /// Line carrying the marker
        seq: u64,
    },
    /// The final marker was observed
    Completed {
        /// Test name
        test: String,
        /// Completing line
        seq: u64,
    },
    /// The test reported an error; the run halts
    Failed {
        /// Test name
        test: String,
        /// Failure reason
        reason: String,
        /// Offending line, absent when a wall-clock budget expired
        seq: Option<u64>,
    },
}

impl TestEvent {
    /// Name of the test the event belongs to
    pub fn test(&self) -> &str {
        match self {
            Self::Activated { test, .. }
            | Self::MarkerDetected { test, .. }
            | Self::Completed { test, .. }
            | Self::Failed { test, .. } => test,
        }
    }

    /// Is this a failure notification?
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for TestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activated { test, .. } => write!(f, "Activated: {test}"),
            Self::MarkerDetected { test, marker, .. } => write!(f, "{test} detected: {marker}"),
            Self::Completed { test, .. } => write!(f, "{test} completed successfully"),
            Self::Failed { test, reason, .. } => write!(f, "{test} failed: {reason}"),
        }
    }
}

/// Destination for test notifications
pub trait EventSink: Send {
    /// Deliver one event
    fn emit(&mut self, event: &TestEvent);
}

/// Emits events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &TestEvent) {
        match event {
            TestEvent::Activated { test, seq } => {
                tracing::info!(test = %test, seq, "Activated: {}", test);
            }
            TestEvent::MarkerDetected { test, marker, seq } => {
                tracing::info!(test = %test, seq, marker = %marker, "Detected: {}", marker);
            }
            TestEvent::Completed { test, seq } => {
                tracing::info!(test = %test, seq, "{} completed successfully", test);
            }
            TestEvent::Failed { test, reason, seq } => {
                tracing::error!(test = %test, ?seq, reason = %reason, "Test failed. Stopping execution.");
            }
        }
    }
}

/// Keeps every event in memory; clones share the same buffer
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TestEvent>>>,
}

impl RecordingSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<TestEvent> {
        self.events.lock().clone()
    }

    /// Number of marker detections recorded
    pub fn marker_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TestEvent::MarkerDetected { .. }))
            .count()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &TestEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards each event to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Add a boxed sink
    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// No sinks attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&mut self, event: &TestEvent) {
        for sink in &mut self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        let mut fanout = FanoutSink::new().with(a.clone()).with(b.clone()).with(TracingSink);
        assert_eq!(fanout.len(), 3);

        fanout.emit(&TestEvent::Completed { test: "BootupTest".into(), seq: 4 });
        assert_eq!(a.events(), b.events());
        assert_eq!(a.events()[0].test(), "BootupTest");
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = TestEvent::MarkerDetected {
            test: "CheckinTest".into(),
            marker: "POST OK".into(),
            seq: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "marker_detected");
        assert_eq!(json["marker"], "POST OK");
        assert_eq!(event.to_string(), "CheckinTest detected: POST OK");
    }
}
