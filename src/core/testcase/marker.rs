//! Marker accumulation state machine

use super::{TestBudget, TestCase, TestDefinitionError, TestState, Verdict};
use crate::core::events::{EventSink, TestEvent};
use crate::core::line::LogLine;
use std::collections::HashSet;

/// A test parametrised by a trigger and an ordered list of required markers.
///
/// While active, every line is checked against each marker not yet seen
/// (case-sensitive substring, anywhere in the line). Detection is
/// idempotent. The test is done once the *last* marker in the list has been
/// seen, regardless of which earlier markers were observed.
#[derive(Debug, Clone)]
pub struct MarkerTest {
    name: String,
    trigger: String,
    markers: Vec<String>,
    fail_markers: Vec<String>,
    budget: TestBudget,
    state: TestState,
    detected: HashSet<String>,
}

impl MarkerTest {
    /// Create a test from its trigger and completion markers
    pub fn new<I, S>(
        name: impl Into<String>,
        trigger: impl Into<String>,
        markers: I,
    ) -> Result<Self, TestDefinitionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let trigger = trigger.into();
        let markers: Vec<String> = markers.into_iter().map(Into::into).collect();

        if name.is_empty() {
            return Err(TestDefinitionError::EmptyName);
        }
        if trigger.is_empty() {
            return Err(TestDefinitionError::EmptyTrigger(name));
        }
        if markers.is_empty() {
            return Err(TestDefinitionError::NoMarkers(name));
        }
        if markers.iter().any(String::is_empty) {
            return Err(TestDefinitionError::EmptyMarker(name));
        }

        Ok(Self {
            name,
            trigger,
            markers,
            fail_markers: Vec::new(),
            budget: TestBudget::unlimited(),
            state: TestState::NotTriggered,
            detected: HashSet::new(),
        })
    }

    /// Substrings that fail the test when seen while active
    pub fn with_fail_markers<I, S>(mut self, markers: I) -> Result<Self, TestDefinitionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers: Vec<String> = markers.into_iter().map(Into::into).collect();
        if markers.iter().any(String::is_empty) {
            return Err(TestDefinitionError::EmptyMarker(self.name));
        }
        self.fail_markers = markers;
        Ok(self)
    }

    /// Limit a single activation
    #[must_use]
    pub fn with_budget(mut self, budget: TestBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Bootloader through application start and first temperature reading
    pub fn bootup() -> Self {
        Self::builtin(
            "BootupTest",
            "Aquana SV Bootloader",
            &[
                "Aquana SV Bootloader",
                "AQSV Started",
                "START_APPLICATION_EVT",
                "Calibrated temp:",
            ],
        )
    }

    /// Cellular modem power-up, network registration and server check-in
    pub fn checkin() -> Self {
        Self::builtin(
            "CheckinTest",
            "WAN_COMMS_TIMER_EVT",
            &[
                "WAN power supply enabled",
                "WAN power-up complete",
                "cellular_net_registration, Activated IP:",
                "POST OK",
                "Wan_Comms_Timeout_Timer_Stop",
            ],
        )
    }

    fn builtin(name: &str, trigger: &str, markers: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            trigger: trigger.to_string(),
            markers: markers.iter().map(|m| (*m).to_string()).collect(),
            fail_markers: Vec::new(),
            budget: TestBudget::unlimited(),
            state: TestState::NotTriggered,
            detected: HashSet::new(),
        }
    }

    /// Trigger pattern
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Required markers in order
    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Failure markers
    pub fn fail_markers(&self) -> &[String] {
        &self.fail_markers
    }

    fn final_marker(&self) -> &str {
        // Non-empty by construction.
        self.markers.last().map_or("", String::as_str)
    }
}

impl TestCase for MarkerTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> TestState {
        self.state
    }

    fn is_triggered(&self, line: &LogLine) -> bool {
        line.contains(&self.trigger)
    }

    fn process_line(&mut self, line: &LogLine, events: &mut dyn EventSink) -> Verdict {
        self.state = TestState::Active;

        if let Some(fail) = self.fail_markers.iter().find(|m| line.contains(m)) {
            self.state = TestState::Failed;
            return Verdict::Error(format!("failure marker observed: {fail}"));
        }

        for marker in &self.markers {
            if self.detected.contains(marker) || !line.contains(marker) {
                continue;
            }
            self.detected.insert(marker.clone());
            events.emit(&TestEvent::MarkerDetected {
                test: self.name.clone(),
                marker: marker.clone(),
                seq: line.seq(),
            });
        }

        if self.detected.contains(self.final_marker()) {
            self.state = TestState::Passed;
            Verdict::Done
        } else {
            Verdict::Continue
        }
    }

    fn reset(&mut self) {
        self.state = TestState::NotTriggered;
        self.detected.clear();
    }

    fn detected_markers(&self) -> Vec<&str> {
        self.markers
            .iter()
            .filter(|m| self.detected.contains(*m))
            .map(String::as_str)
            .collect()
    }

    fn budget(&self) -> TestBudget {
        self.budget
    }

    fn abort(&mut self) {
        self.state = TestState::Failed;
    }
}

/// The built-in device tests in registration order
pub fn builtin_suite() -> Vec<MarkerTest> {
    vec![MarkerTest::bootup(), MarkerTest::checkin()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::RecordingSink;

    fn line(seq: u64, text: &str) -> LogLine {
        LogLine::new(seq, text)
    }

    #[test]
    fn test_trigger_is_pure() {
        let test = MarkerTest::checkin();
        assert!(test.is_triggered(&line(0, "[12] WAN_COMMS_TIMER_EVT fired")));
        assert!(!test.is_triggered(&line(1, "wan_comms_timer_evt")));
        assert_eq!(test.state(), TestState::NotTriggered);
        assert!(test.detected_markers().is_empty());
    }

    #[test]
    fn test_repeated_marker_counts_once() {
        let mut test = MarkerTest::bootup();
        let mut sink = RecordingSink::new();
        test.reset();

        assert_eq!(test.process_line(&line(0, "AQSV Started"), &mut sink), Verdict::Continue);
        assert_eq!(test.process_line(&line(1, "AQSV Started"), &mut sink), Verdict::Continue);
        assert_eq!(test.detected_markers(), vec!["AQSV Started"]);
        assert_eq!(sink.marker_count(), 1);
    }

    #[test]
    fn test_done_only_on_final_marker() {
        let mut test = MarkerTest::bootup();
        let mut sink = RecordingSink::new();
        test.reset();

        // Final marker alone is enough; earlier markers are informational.
        assert_eq!(test.process_line(&line(0, "Calibrated temp: 21C"), &mut sink), Verdict::Done);
        assert_eq!(test.state(), TestState::Passed);
    }

    #[test]
    fn test_one_line_can_hit_several_markers() {
        let mut test = MarkerTest::checkin();
        let mut sink = RecordingSink::new();
        test.reset();

        let verdict = test.process_line(
            &line(0, "WAN power supply enabled; WAN power-up complete"),
            &mut sink,
        );
        assert_eq!(verdict, Verdict::Continue);
        assert_eq!(sink.marker_count(), 2);
        assert_eq!(
            test.detected_markers(),
            vec!["WAN power supply enabled", "WAN power-up complete"]
        );
    }

    #[test]
    fn test_reset_clears_history() {
        let mut test = MarkerTest::checkin();
        let mut sink = RecordingSink::new();
        test.reset();
        test.process_line(&line(0, "POST OK"), &mut sink);
        assert_eq!(test.process_line(&line(1, "Wan_Comms_Timeout_Timer_Stop"), &mut sink), Verdict::Done);

        test.reset();
        assert_eq!(test.state(), TestState::NotTriggered);
        assert!(test.detected_markers().is_empty());
        assert_eq!(test.process_line(&line(2, "POST OK"), &mut sink), Verdict::Continue);
        assert_eq!(test.state(), TestState::Active);
    }

    #[test]
    fn test_fail_marker_yields_error() {
        let mut test = MarkerTest::new("Watchdog", "boot", ["ready"])
            .unwrap()
            .with_fail_markers(["HardFault"])
            .unwrap();
        let mut sink = RecordingSink::new();
        test.reset();

        let verdict = test.process_line(&line(0, "HardFault at 0x0800_1234 ready"), &mut sink);
        assert_eq!(verdict, Verdict::Error("failure marker observed: HardFault".into()));
        assert_eq!(test.state(), TestState::Failed);
        assert_eq!(sink.marker_count(), 0);
    }

    #[test]
    fn test_definition_validation() {
        assert_eq!(
            MarkerTest::new("", "t", ["m"]).unwrap_err(),
            TestDefinitionError::EmptyName
        );
        assert_eq!(
            MarkerTest::new("x", "", ["m"]).unwrap_err(),
            TestDefinitionError::EmptyTrigger("x".into())
        );
        assert_eq!(
            MarkerTest::new("x", "t", Vec::<String>::new()).unwrap_err(),
            TestDefinitionError::NoMarkers("x".into())
        );
        assert_eq!(
            MarkerTest::new("x", "t", ["a", ""]).unwrap_err(),
            TestDefinitionError::EmptyMarker("x".into())
        );
    }

    #[test]
    fn test_builtin_suite_order() {
        let suite = builtin_suite();
        let names: Vec<&str> = suite.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["BootupTest", "CheckinTest"]);
        assert_eq!(suite[0].trigger(), suite[0].markers()[0]);
    }
}
