//! Test run composition
//!
//! Wires a line source to the dispatcher through the line queue, runs the
//! build step and only then enables console echo and dispatching.

use super::build::{BuildError, BuildStep};
use super::dispatcher::{DispatchError, DispatchPolicy, DispatchReport, Dispatcher};
use super::events::EventSink;
use super::queue;
use super::source::{spawn_source, Echo, LineSource, OutputGate, SourceError};
use super::testcase::TestCase;
use thiserror::Error;

/// Run errors
#[derive(Error, Debug)]
pub enum RunError {
    /// Build or flash failed; nothing was dispatched
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Test registration failed
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A worker thread could not be started or panicked
    #[error("Worker thread failed: {0}")]
    Worker(String),
}

/// Result of a completed run
#[derive(Debug)]
pub struct RunOutcome {
    /// Dispatcher summary
    pub report: DispatchReport,
    /// Source failure that ended the stream, if any
    pub source_error: Option<SourceError>,
}

impl RunOutcome {
    /// Did the run pass?
    pub fn passed(&self) -> bool {
        self.report.passed() && self.source_error.is_none()
    }
}

/// Composition root for a single test run
pub struct Runner {
    tests: Vec<Box<dyn TestCase>>,
    policy: DispatchPolicy,
    echo: Option<Echo>,
}

impl Runner {
    /// Create a runner with the given policy
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            tests: Vec::new(),
            policy,
            echo: None,
        }
    }

    /// Add a test; order of calls is registration order
    #[must_use]
    pub fn with_test(mut self, test: impl TestCase + 'static) -> Self {
        self.tests.push(Box::new(test));
        self
    }

    /// Add several tests in order
    #[must_use]
    pub fn with_tests<I, T>(mut self, tests: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: TestCase + 'static,
    {
        for test in tests {
            self.tests.push(Box::new(test));
        }
        self
    }

    /// Echo raw device output here once the build has finished
    #[must_use]
    pub fn echo(mut self, out: Echo) -> Self {
        self.echo = Some(out);
        self
    }

    /// Execute the run.
    ///
    /// Ingestion starts before the build so no early boot line is lost;
    /// console echo and dispatching start only after a successful build.
    pub async fn run<S: LineSource>(
        self,
        source: S,
        build: &dyn BuildStep,
        events: impl EventSink + 'static,
    ) -> Result<RunOutcome, RunError> {
        let mut dispatcher = Dispatcher::with_policy(events, self.policy);
        for test in self.tests {
            dispatcher.register_boxed(test)?;
        }

        let (sender, lines) = queue::channel();
        let gate = OutputGate::new();
        let mut source_handle = spawn_source(source, sender, gate.clone(), self.echo)
            .map_err(|e| RunError::Worker(e.to_string()))?;

        tracing::info!(build = %build.name(), "Starting test run");
        if let Err(e) = build.execute().await {
            tracing::error!("Build process failed: {}", e);
            gate.abandon();
            drop(lines);
            source_handle.join_echo();
            return Err(e.into());
        }

        gate.open();
        tracing::info!("Build process completed, dispatching device output");

        let report = tokio::task::spawn_blocking(move || dispatcher.run(&lines))
            .await
            .map_err(|e| RunError::Worker(e.to_string()))?;

        // A source blocked on device I/O is left running; it stops on its
        // next push now that the queue is gone.
        let source_error = if source_handle.is_finished() {
            source_handle.join().err()
        } else {
            None
        };

        Ok(RunOutcome {
            report,
            source_error,
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(DispatchPolicy::indefinite())
    }
}
