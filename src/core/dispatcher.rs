//! Line dispatcher
//!
//! Owns the registered tests and the single active slot. Lines are pulled
//! from the [`LineQueue`] in arrival order; while no test is active each line
//! is offered to the registered tests in registration order and the first
//! whose trigger matches claims it. The triggering line is then evaluated by
//! the newly active test like any other line.
//!
//! A test failure halts the whole run (fail-fast). The dispatcher's own
//! lifecycle is explicit in [`DispatcherPhase`].

use super::events::{EventSink, TestEvent};
use super::line::LogLine;
use super::queue::{LineQueue, Pulled};
use super::testcase::{TestCase, TestState, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatcherPhase {
    /// Accepting registrations
    Initializing,
    /// Consuming lines
    Dispatching,
    /// A test failed
    HaltedOnError,
    /// The line source closed
    HaltedOnStreamEnd,
    /// No test triggered within the idle timeout
    HaltedOnIdleTimeout,
    /// Every test named in the stop list completed
    HaltedOnCompletion,
}

impl DispatcherPhase {
    /// Has dispatching stopped for good?
    pub fn is_halted(&self) -> bool {
        !matches!(self, Self::Initializing | Self::Dispatching)
    }
}

impl fmt::Display for DispatcherPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::HaltedOnError => write!(f, "halted on error"),
            Self::HaltedOnStreamEnd => write!(f, "halted on stream end"),
            Self::HaltedOnIdleTimeout => write!(f, "halted on idle timeout"),
            Self::HaltedOnCompletion => write!(f, "halted on completion"),
        }
    }
}

/// Run-level policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Halt when no test has been active for this long
    pub idle_timeout: Option<Duration>,
    /// Finish once all of these tests have completed at least once
    pub stop_after: Vec<String>,
}

impl DispatchPolicy {
    /// Run until the stream ends or a test fails
    pub fn indefinite() -> Self {
        Self::default()
    }

    /// Set idle timeout
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set tests that end the run once completed
    #[must_use]
    pub fn stop_after<I, S>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_after = tests.into_iter().map(Into::into).collect();
        self
    }
}

/// Dispatcher errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Registration attempted after dispatching started
    #[error("Cannot register {0}: dispatcher is {1}")]
    AlreadyRunning(String, DispatcherPhase),

    /// Two tests share a name
    #[error("A test named {0} is already registered")]
    DuplicateTest(String),
}

/// What a single line did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// No test active and no trigger matched
    Discarded,
    /// A test activated and is still running
    Activated(String),
    /// The active test keeps running
    Continued(String),
    /// The active test completed
    Completed(String),
    /// The active test failed; dispatching has halted
    Failed(String),
    /// Dispatching had already halted; the line was ignored
    Halted,
}

/// Failure that halted the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Failing test
    pub test: String,
    /// Reason reported by the test or the dispatcher
    pub reason: String,
    /// Offending line, if any
    pub seq: Option<u64>,
}

/// Summary of a dispatch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Phase the dispatcher ended in
    pub phase: DispatcherPhase,
    /// Completed activations in order
    pub completed: Vec<String>,
    /// Failure, when halted on error
    pub failure: Option<TestFailure>,
    /// Test still active when the run ended
    pub interrupted: Option<String>,
    /// Lines pulled
    pub lines_consumed: u64,
    /// Lines no test claimed
    pub lines_discarded: u64,
}

impl DispatchReport {
    /// Did the run end without a failure, timeout or unfinished test?
    pub fn passed(&self) -> bool {
        self.failure.is_none()
            && self.interrupted.is_none()
            && self.phase != DispatcherPhase::HaltedOnIdleTimeout
    }
}

struct ActiveSlot {
    index: usize,
    activated_at: Instant,
    lines: u64,
}

/// Routes device lines to registered tests
pub struct Dispatcher {
    tests: Vec<Box<dyn TestCase>>,
    active: Option<ActiveSlot>,
    phase: DispatcherPhase,
    policy: DispatchPolicy,
    events: Box<dyn EventSink>,
    idle_since: Instant,
    completed: Vec<String>,
    failure: Option<TestFailure>,
    lines_consumed: u64,
    lines_discarded: u64,
}

impl Dispatcher {
    /// Create a dispatcher that runs indefinitely
    pub fn new(events: impl EventSink + 'static) -> Self {
        Self::with_policy(events, DispatchPolicy::indefinite())
    }

    /// Create a dispatcher with an explicit policy
    pub fn with_policy(events: impl EventSink + 'static, policy: DispatchPolicy) -> Self {
        Self {
            tests: Vec::new(),
            active: None,
            phase: DispatcherPhase::Initializing,
            policy,
            events: Box::new(events),
            idle_since: Instant::now(),
            completed: Vec::new(),
            failure: None,
            lines_consumed: 0,
            lines_discarded: 0,
        }
    }

    /// Register a test. Registration order decides trigger ties.
    pub fn register(&mut self, test: impl TestCase + 'static) -> Result<(), DispatchError> {
        self.register_boxed(Box::new(test))
    }

    /// Register a boxed test
    pub fn register_boxed(&mut self, test: Box<dyn TestCase>) -> Result<(), DispatchError> {
        if self.phase != DispatcherPhase::Initializing {
            return Err(DispatchError::AlreadyRunning(test.name().to_string(), self.phase));
        }
        if self.tests.iter().any(|t| t.name() == test.name()) {
            return Err(DispatchError::DuplicateTest(test.name().to_string()));
        }
        tracing::debug!(test = test.name(), position = self.tests.len(), "Registered test");
        self.tests.push(test);
        Ok(())
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> DispatcherPhase {
        self.phase
    }

    /// Name of the active test
    pub fn active_test(&self) -> Option<&str> {
        self.active.as_ref().map(|slot| self.tests[slot.index].name())
    }

    /// Registered tests with their states, in registration order
    pub fn tests(&self) -> impl Iterator<Item = (&str, TestState)> + '_ {
        self.tests.iter().map(|t| (t.name(), t.state()))
    }

    /// Number of tests currently in the active state
    pub fn active_count(&self) -> usize {
        self.tests.iter().filter(|t| t.state().is_active()).count()
    }

    /// Summary so far
    pub fn report(&self) -> DispatchReport {
        DispatchReport {
            phase: self.phase,
            completed: self.completed.clone(),
            failure: self.failure.clone(),
            interrupted: self.active_test().map(str::to_string),
            lines_consumed: self.lines_consumed,
            lines_discarded: self.lines_discarded,
        }
    }

    /// Feed a single line through the state machine
    pub fn step(&mut self, line: &LogLine) -> Step {
        if self.phase.is_halted() {
            return Step::Halted;
        }
        if self.phase == DispatcherPhase::Initializing {
            self.start();
        }
        self.lines_consumed += 1;

        if self.active.is_some() {
            return self.feed_active(line);
        }

        let Some(index) = self.tests.iter().position(|t| t.is_triggered(line)) else {
            self.lines_discarded += 1;
            tracing::trace!(seq = line.seq(), "Discarded line");
            return Step::Discarded;
        };

        let test = &mut self.tests[index];
        test.reset();
        let name = test.name().to_string();
        self.active = Some(ActiveSlot {
            index,
            activated_at: Instant::now(),
            lines: 0,
        });
        self.events.emit(&TestEvent::Activated {
            test: name.clone(),
            seq: line.seq(),
        });

        match self.feed_active(line) {
            Step::Continued(_) => Step::Activated(name),
            other => other,
        }
    }

    /// Consume the queue until a halt condition
    pub fn run(&mut self, queue: &LineQueue) -> DispatchReport {
        if self.phase == DispatcherPhase::Initializing {
            self.start();
        }
        tracing::info!(tests = self.tests.len(), "Dispatch started");

        while !self.phase.is_halted() {
            let pulled = match self.next_deadline() {
                None => queue.pull().map_or(Pulled::Closed, Pulled::Line),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        Pulled::TimedOut
                    } else {
                        queue.pull_timeout(deadline - now)
                    }
                }
            };

            match pulled {
                Pulled::Line(line) => {
                    self.step(&line);
                }
                Pulled::TimedOut => self.expire(Instant::now()),
                Pulled::Closed => {
                    if let Some(name) = self.active_test() {
                        tracing::warn!(test = name, "Line source closed while test active");
                    }
                    self.phase = DispatcherPhase::HaltedOnStreamEnd;
                }
            }
        }

        let report = self.report();
        tracing::info!(
            phase = %report.phase,
            completed = report.completed.len(),
            lines = report.lines_consumed,
            "Dispatch finished"
        );
        report
    }

    fn start(&mut self) {
        self.phase = DispatcherPhase::Dispatching;
        self.idle_since = Instant::now();
    }

    fn feed_active(&mut self, line: &LogLine) -> Step {
        let Some(slot) = self.active.as_mut() else {
            return Step::Discarded;
        };
        slot.lines += 1;
        let lines = slot.lines;
        let test = &mut self.tests[slot.index];
        let name = test.name().to_string();

        match test.process_line(line, self.events.as_mut()) {
            Verdict::Done => {
                self.finish_active(&name, line.seq());
                Step::Completed(name)
            }
            Verdict::Error(reason) => {
                self.fail_active(reason, Some(line.seq()));
                Step::Failed(name)
            }
            Verdict::Continue => {
                let max_lines = test.budget().max_lines;
                if max_lines.is_some_and(|max| lines >= max) {
                    self.fail_active(format!("no completion within {lines} lines"), Some(line.seq()));
                    return Step::Failed(name);
                }
                Step::Continued(name)
            }
        }
    }

    fn finish_active(&mut self, name: &str, seq: u64) {
        self.active = None;
        self.idle_since = Instant::now();
        self.completed.push(name.to_string());
        self.events.emit(&TestEvent::Completed {
            test: name.to_string(),
            seq,
        });

        let all_done = !self.policy.stop_after.is_empty()
            && self
                .policy
                .stop_after
                .iter()
                .all(|wanted| self.completed.iter().any(|c| c == wanted));
        if all_done {
            self.phase = DispatcherPhase::HaltedOnCompletion;
        }
    }

    fn fail_active(&mut self, reason: String, seq: Option<u64>) {
        let Some(slot) = self.active.take() else {
            return;
        };
        let test = &mut self.tests[slot.index];
        if test.state() != TestState::Failed {
            test.abort();
        }
        let name = test.name().to_string();

        self.events.emit(&TestEvent::Failed {
            test: name.clone(),
            reason: reason.clone(),
            seq,
        });
        self.failure = Some(TestFailure {
            test: name,
            reason,
            seq,
        });
        self.phase = DispatcherPhase::HaltedOnError;
    }

    // A limit too large to represent as an instant never expires.
    fn next_deadline(&self) -> Option<Instant> {
        match &self.active {
            Some(slot) => self.tests[slot.index]
                .budget()
                .timeout
                .and_then(|t| slot.activated_at.checked_add(t)),
            None => self
                .policy
                .idle_timeout
                .and_then(|t| self.idle_since.checked_add(t)),
        }
    }

    fn expire(&mut self, now: Instant) {
        let Some(deadline) = self.next_deadline() else {
            return;
        };
        if now < deadline {
            return;
        }

        match &self.active {
            Some(slot) => {
                let elapsed = now.duration_since(slot.activated_at);
                self.fail_active(format!("no completion within {elapsed:.1?}"), None);
            }
            None => {
                tracing::warn!(
                    idle = ?now.duration_since(self.idle_since),
                    "No test triggered before idle timeout"
                );
                self.phase = DispatcherPhase::HaltedOnIdleTimeout;
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("phase", &self.phase)
            .field("tests", &self.tests)
            .field("active", &self.active_test())
            .field("lines_consumed", &self.lines_consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::RecordingSink;
    use crate::core::queue;
    use crate::core::testcase::{MarkerTest, TestBudget};
    use std::thread;

    fn line(seq: u64, text: &str) -> LogLine {
        LogLine::new(seq, text)
    }

    fn dispatcher() -> (Dispatcher, RecordingSink) {
        let sink = RecordingSink::new();
        (Dispatcher::new(sink.clone()), sink)
    }

    #[test]
    fn test_boot_scenario() {
        let (mut d, sink) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();

        assert_eq!(d.step(&line(0, "noise")), Step::Discarded);
        assert_eq!(d.step(&line(1, "Aquana SV Bootloader v1")), Step::Activated("BootupTest".into()));
        assert_eq!(d.step(&line(2, "AQSV Started")), Step::Continued("BootupTest".into()));
        assert_eq!(d.step(&line(3, "Calibrated temp: 25C")), Step::Completed("BootupTest".into()));

        assert_eq!(sink.marker_count(), 3);
        assert_eq!(
            sink.events().first(),
            Some(&TestEvent::Activated { test: "BootupTest".into(), seq: 1 })
        );
        assert_eq!(
            sink.events().last(),
            Some(&TestEvent::Completed { test: "BootupTest".into(), seq: 3 })
        );
        assert_eq!(d.active_test(), None);
        let report = d.report();
        assert_eq!(report.completed, vec!["BootupTest".to_string()]);
        assert_eq!(report.lines_discarded, 1);
        assert!(report.passed());
    }

    #[test]
    fn test_first_registered_wins() {
        let (mut d, _) = dispatcher();
        d.register(MarkerTest::new("First", "EVT", ["first done"]).unwrap()).unwrap();
        d.register(MarkerTest::new("Second", "EVT", ["second done"]).unwrap()).unwrap();

        assert_eq!(d.step(&line(0, "EVT")), Step::Activated("First".into()));
        let states: Vec<_> = d.tests().collect();
        assert_eq!(states, vec![("First", TestState::Active), ("Second", TestState::NotTriggered)]);
    }

    #[test]
    fn test_active_test_sees_other_triggers_as_plain_lines() {
        let (mut d, _) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();
        d.register(MarkerTest::checkin()).unwrap();

        d.step(&line(0, "Aquana SV Bootloader"));
        assert_eq!(d.step(&line(1, "WAN_COMMS_TIMER_EVT")), Step::Continued("BootupTest".into()));
        assert_eq!(d.active_count(), 1);
        assert_eq!(d.step(&line(2, "Calibrated temp: 20C")), Step::Completed("BootupTest".into()));
        assert_eq!(d.step(&line(3, "WAN_COMMS_TIMER_EVT")), Step::Activated("CheckinTest".into()));
        assert_eq!(d.active_count(), 1);
    }

    #[test]
    fn test_reactivation_resets_markers() {
        let (mut d, sink) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();

        d.step(&line(0, "Aquana SV Bootloader"));
        d.step(&line(1, "AQSV Started"));
        d.step(&line(2, "Calibrated temp: 1C"));
        sink.clear();

        // Second boot cycle re-detects everything from scratch.
        d.step(&line(3, "Aquana SV Bootloader"));
        d.step(&line(4, "AQSV Started"));
        assert_eq!(sink.marker_count(), 2);
        assert_eq!(d.report().completed.len(), 1);
    }

    #[test]
    fn test_error_halts_dispatch() {
        let (mut d, sink) = dispatcher();
        d.register(
            MarkerTest::new("Boot", "boot", ["up"])
                .unwrap()
                .with_fail_markers(["panic"])
                .unwrap(),
        )
        .unwrap();
        d.register(MarkerTest::checkin()).unwrap();

        d.step(&line(0, "boot"));
        assert_eq!(d.step(&line(1, "kernel panic")), Step::Failed("Boot".into()));
        assert_eq!(d.phase(), DispatcherPhase::HaltedOnError);
        assert_eq!(d.step(&line(2, "WAN_COMMS_TIMER_EVT")), Step::Halted);
        assert!(sink.events().iter().any(TestEvent::is_failure));

        let report = d.report();
        assert!(!report.passed());
        assert_eq!(report.failure.unwrap().seq, Some(1));
        assert_eq!(report.lines_consumed, 2);
    }

    #[test]
    fn test_line_budget() {
        let (mut d, _) = dispatcher();
        d.register(
            MarkerTest::checkin().with_budget(TestBudget::unlimited().max_lines(3)),
        )
        .unwrap();

        d.step(&line(0, "WAN_COMMS_TIMER_EVT"));
        d.step(&line(1, "WAN power supply enabled"));
        assert_eq!(d.step(&line(2, "still waiting")), Step::Failed("CheckinTest".into()));
        assert_eq!(d.tests().next(), Some(("CheckinTest", TestState::Failed)));
    }

    #[test]
    fn test_register_after_start_rejected() {
        let (mut d, _) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();
        assert_eq!(
            d.register(MarkerTest::bootup()),
            Err(DispatchError::DuplicateTest("BootupTest".into()))
        );
        d.step(&line(0, "noise"));
        assert!(matches!(
            d.register(MarkerTest::checkin()),
            Err(DispatchError::AlreadyRunning(_, DispatcherPhase::Dispatching))
        ));
    }

    #[test]
    fn test_run_until_stream_end() {
        let (mut d, _) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();
        let (tx, rx) = queue::channel();

        let producer = thread::spawn(move || {
            for text in ["noise", "Aquana SV Bootloader", "Calibrated temp: 3C", "tail"] {
                tx.push(text);
            }
        });
        let report = d.run(&rx);
        producer.join().unwrap();

        assert_eq!(report.phase, DispatcherPhase::HaltedOnStreamEnd);
        assert_eq!(report.lines_consumed, 4);
        assert!(report.passed());
    }

    #[test]
    fn test_stream_end_mid_test_is_interrupted() {
        let (mut d, _) = dispatcher();
        d.register(MarkerTest::bootup()).unwrap();
        let (tx, rx) = queue::channel();
        tx.push("Aquana SV Bootloader");
        drop(tx);

        let report = d.run(&rx);
        assert_eq!(report.interrupted.as_deref(), Some("BootupTest"));
        assert!(!report.passed());
    }

    #[test]
    fn test_wall_clock_budget_without_lines() {
        let (mut d, sink) = dispatcher();
        d.register(
            MarkerTest::bootup().with_budget(TestBudget::unlimited().timeout(Duration::from_millis(20))),
        )
        .unwrap();
        let (tx, rx) = queue::channel();
        tx.push("Aquana SV Bootloader");

        let report = d.run(&rx);
        drop(tx);
        assert_eq!(report.phase, DispatcherPhase::HaltedOnError);
        assert_eq!(report.failure.map(|f| f.seq), Some(None));
        assert!(sink.events().last().is_some_and(TestEvent::is_failure));
    }

    #[test]
    fn test_idle_timeout() {
        let sink = RecordingSink::new();
        let mut d = Dispatcher::with_policy(
            sink,
            DispatchPolicy::indefinite().idle_timeout(Duration::from_millis(20)),
        );
        d.register(MarkerTest::bootup()).unwrap();
        let (tx, rx) = queue::channel();
        tx.push("unrelated");

        let report = d.run(&rx);
        drop(tx);
        assert_eq!(report.phase, DispatcherPhase::HaltedOnIdleTimeout);
        assert!(!report.passed());
    }

    #[test]
    fn test_stop_after_completion() {
        let sink = RecordingSink::new();
        let mut d = Dispatcher::with_policy(sink, DispatchPolicy::indefinite().stop_after(["BootupTest"]));
        d.register(MarkerTest::bootup()).unwrap();
        let (tx, rx) = queue::channel();
        for text in ["Aquana SV Bootloader", "Calibrated temp: 9C", "more output"] {
            tx.push(text);
        }

        // Sender is still alive: only the stop list can end the run.
        let report = d.run(&rx);
        assert_eq!(report.phase, DispatcherPhase::HaltedOnCompletion);
        assert_eq!(report.lines_consumed, 2);
        assert_eq!(rx.len(), 1);
        drop(tx);
    }

    #[test]
    fn test_huge_limits_mean_no_deadline() {
        let forever = Duration::from_secs(u64::MAX);
        let sink = RecordingSink::new();
        let mut d = Dispatcher::with_policy(sink, DispatchPolicy::indefinite().idle_timeout(forever));
        d.register(MarkerTest::bootup().with_budget(TestBudget::unlimited().timeout(forever)))
            .unwrap();
        let (tx, rx) = queue::channel();
        for text in ["noise", "Aquana SV Bootloader", "AQSV Started"] {
            tx.push(text);
        }
        drop(tx);

        let report = d.run(&rx);
        assert_eq!(report.phase, DispatcherPhase::HaltedOnStreamEnd);
        assert_eq!(report.lines_consumed, 3);
        assert_eq!(report.interrupted.as_deref(), Some("BootupTest"));
        assert!(report.failure.is_none());
    }
}
