//! Test case contract
//!
//! A test case is a small state machine fed one device line at a time while
//! it holds the dispatcher's active slot. Concrete tests are data: see
//! [`MarkerTest`], which covers every built-in test through a trigger string
//! and an ordered marker list.

mod marker;

pub use marker::{builtin_suite, MarkerTest};

use super::events::EventSink;
use super::line::LogLine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Per-line outcome of an active test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the test active
    Continue,
    /// Test passed; release the active slot
    Done,
    /// Test failed; the whole run halts
    Error(String),
}

impl Verdict {
    /// Does this verdict end the activation?
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Lifecycle state of a test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestState {
    /// Waiting for its trigger
    NotTriggered,
    /// Owns the line stream
    Active,
    /// Final marker observed during the last activation
    Passed,
    /// Last activation ended in an error
    Failed,
}

impl TestState {
    /// Is the test currently consuming lines?
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTriggered => write!(f, "not triggered"),
            Self::Active => write!(f, "active"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Limits on a single activation.
///
/// A test that exceeds either limit while still returning
/// [`Verdict::Continue`] is failed by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBudget {
    /// Maximum lines fed to the test, including the triggering line
    pub max_lines: Option<u64>,
    /// Maximum wall-clock time since activation
    pub timeout: Option<Duration>,
}

impl TestBudget {
    /// No limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Set line limit
    #[must_use]
    pub fn max_lines(mut self, lines: u64) -> Self {
        self.max_lines = Some(lines);
        self
    }

    /// Set wall-clock limit
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Is any limit set?
    pub fn is_limited(&self) -> bool {
        self.max_lines.is_some() || self.timeout.is_some()
    }
}

/// Invalid test definition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestDefinitionError {
    /// Test has no name
    #[error("Test name must not be empty")]
    EmptyName,

    /// Trigger pattern is empty
    #[error("Test {0}: trigger must not be empty")]
    EmptyTrigger(String),

    /// No completion markers
    #[error("Test {0}: at least one marker is required")]
    NoMarkers(String),

    /// A marker is the empty string
    #[error("Test {0}: markers must not be empty strings")]
    EmptyMarker(String),

    /// A line or time limit of zero
    #[error("Test {0}: {1} must be greater than zero")]
    ZeroBudget(String, &'static str),
}

/// Contract between the dispatcher and a unit of test logic.
///
/// The dispatcher calls `is_triggered` only while the test is idle,
/// `reset` exactly once right before activation, and `process_line` only
/// while the test holds the active slot. All calls happen on the dispatcher
/// thread.
pub trait TestCase: Send {
    /// Identity used in notifications
    fn name(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> TestState;

    /// Does this line activate the test? Must not mutate state.
    fn is_triggered(&self, line: &LogLine) -> bool;

    /// Evaluate one line while active
    fn process_line(&mut self, line: &LogLine, events: &mut dyn EventSink) -> Verdict;

    /// Clear detected markers and return to the registration baseline
    fn reset(&mut self);

    /// Markers observed since the last reset
    fn detected_markers(&self) -> Vec<&str>;

    /// Activation limits
    fn budget(&self) -> TestBudget {
        TestBudget::unlimited()
    }

    /// Called when the dispatcher fails the test on its behalf
    fn abort(&mut self) {}
}

impl fmt::Debug for dyn TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
