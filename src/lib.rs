//! # Aquatest Core Library
//!
//! Hardware-in-the-loop acceptance testing for embedded devices. The device
//! console is read line by line while the device boots and runs, and each
//! line is routed to whichever registered test is currently active.
//!
//! ## Features
//!
//! - Unbounded, ordered line queue between reader and dispatcher
//! - Tests as data: a trigger plus an ordered list of markers
//! - Exactly one active test; first registered trigger wins
//! - Fail-fast on test errors, optional per-test and idle budgets
//! - Serial, stdin/file replay and child-process (RTT) sources
//! - Build/flash step gating console echo
//! - JSON-lines session log
//!
//! ## Example
//!
//! ```rust,no_run
//! use aquatest_core::{MarkerTest, NoBuild, Runner, SerialSource, TracingSink};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = SerialSource::open("/dev/ttyUSB0", 115_200)?;
//!     let outcome = Runner::default()
//!         .with_tests([MarkerTest::bootup(), MarkerTest::checkin()])
//!         .run(source, &NoBuild, TracingSink)
//!         .await?;
//!
//!     println!("completed: {:?}", outcome.report.completed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, ConfigError, TestDefinition};
pub use crate::core::build::{BuildError, BuildStep, NoBuild, ShellBuild};
pub use crate::core::dispatcher::{
    DispatchError, DispatchPolicy, DispatchReport, Dispatcher, DispatcherPhase, Step, TestFailure,
};
pub use crate::core::events::{EventSink, FanoutSink, RecordingSink, TestEvent, TracingSink};
pub use crate::core::line::LogLine;
pub use crate::core::queue::{LineQueue, LineSender, Pulled};
pub use crate::core::runner::{RunError, RunOutcome, Runner};
pub use crate::core::session_log::{LogLevel, SessionLog};
pub use crate::core::source::{
    clean_line, LineSource, OutputGate, ProcessSource, ReaderSource, SerialCommander, SerialSource,
    SourceError,
};
pub use crate::core::testcase::{
    builtin_suite, MarkerTest, TestBudget, TestCase, TestDefinitionError, TestState, Verdict,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
