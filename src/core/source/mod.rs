//! Line sources
//!
//! A source yields raw device output one line at a time. The ingestion
//! thread strips ANSI/VT-102 escapes, trims whitespace, drops empty lines and
//! pushes the rest onto the [`LineSender`]. Raw lines are also echoed to the
//! console, but only once the [`OutputGate`] opens, so build-tool output and
//! device output do not interleave. Enqueueing is never gated.
//!
//! Supports:
//! - Serial ports
//! - Any buffered reader (stdin, captured log files)
//! - Child processes such as a debug-probe RTT client

mod process;
mod reader;
mod serial;

pub use process::ProcessSource;
pub use reader::ReaderSource;
pub use serial::{list_ports, SerialCommander, SerialSource, DEFAULT_BAUD_RATE};

use super::queue::LineSender;
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use std::io::Write;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Line source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Child process could not be started
    #[error("Failed to start {0}: {1}")]
    SpawnFailed(String, std::io::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Producer of raw device output lines
pub trait LineSource: Send + 'static {
    /// Human-readable description
    fn name(&self) -> String;

    /// Block until the next raw line; `Ok(None)` ends the stream
    fn read_line(&mut self) -> Result<Option<String>, SourceError>;
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI pattern is valid")
    })
}

/// Strip escape sequences and surrounding whitespace
pub fn clean_line(raw: &str) -> String {
    ansi_escape().replace_all(raw, "").trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GateState {
    #[default]
    Closed,
    Open,
    Abandoned,
}

/// One-shot signal that enables console echo.
///
/// The gate leaves the closed state exactly once: it either opens, or it is
/// abandoned when the run ends before echo was ever enabled.
#[derive(Debug, Clone, Default)]
pub struct OutputGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl OutputGate {
    /// Create a closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate and wake every waiter. Opening twice is harmless.
    pub fn open(&self) {
        self.settle(GateState::Open);
    }

    /// Give up on the gate; waiters return without echoing
    pub fn abandon(&self) {
        self.settle(GateState::Abandoned);
    }

    fn settle(&self, to: GateState) {
        let (state, cvar) = &*self.inner;
        let mut state = state.lock();
        if *state == GateState::Closed {
            *state = to;
        }
        cvar.notify_all();
    }

    /// Has the gate been opened?
    pub fn is_open(&self) -> bool {
        *self.inner.0.lock() == GateState::Open
    }

    /// Block until the gate opens or is abandoned; returns whether it opened
    pub fn wait(&self) -> bool {
        let (state, cvar) = &*self.inner;
        let mut guard = state.lock();
        while *guard == GateState::Closed {
            cvar.wait(&mut guard);
        }
        *guard == GateState::Open
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (state, cvar) = &*self.inner;
        let mut guard = state.lock();
        if *guard == GateState::Closed {
            cvar.wait_for(&mut guard, timeout);
        }
        *guard == GateState::Open
    }
}

/// Where raw lines are echoed once the gate opens
pub type Echo = Box<dyn Write + Send>;

/// Running ingestion threads
pub struct SourceHandle {
    reader: JoinHandle<Result<u64, SourceError>>,
    echo: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// Has the reader thread exited?
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Wait for the echo thread, if any. Call after the gate has opened or
    /// been abandoned.
    pub fn join_echo(&mut self) {
        if let Some(echo) = self.echo.take() {
            let _ = echo.join();
        }
    }

    /// Wait for the source to end; returns the number of lines enqueued
    pub fn join(self) -> Result<u64, SourceError> {
        let result = self
            .reader
            .join()
            .unwrap_or_else(|_| Err(SourceError::ConnectionFailed("reader thread panicked".into())));
        if let Some(echo) = self.echo {
            let _ = echo.join();
        }
        result
    }
}

/// Start the producer context.
///
/// The reader thread owns `sender`; when the source ends or fails the sender
/// is dropped and the dispatcher observes end of stream. With `echo` set, a
/// second thread waits for `gate` and then writes every raw line to it.
pub fn spawn_source<S: LineSource>(
    source: S,
    sender: LineSender,
    gate: OutputGate,
    echo: Option<Echo>,
) -> std::io::Result<SourceHandle> {
    let (echo_tx, echo_handle) = match echo {
        Some(out) => {
            let (tx, rx) = crossbeam_channel::unbounded::<String>();
            let handle = thread::Builder::new()
                .name("line-echo".into())
                .spawn(move || echo_lines(&rx, &gate, out))?;
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let reader = thread::Builder::new()
        .name("line-source".into())
        .spawn(move || ingest(source, &sender, echo_tx.as_ref()))?;

    Ok(SourceHandle {
        reader,
        echo: echo_handle,
    })
}

fn ingest<S: LineSource>(
    mut source: S,
    sender: &LineSender,
    echo: Option<&crossbeam_channel::Sender<String>>,
) -> Result<u64, SourceError> {
    let name = source.name();
    tracing::info!(source = %name, "Line source started");

    let mut enqueued = 0u64;
    loop {
        let raw = match source.read_line() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::info!(source = %name, lines = enqueued, "Line source closed");
                return Ok(enqueued);
            }
            Err(e) => {
                tracing::error!(source = %name, lines = enqueued, "Line source failed: {}", e);
                return Err(e);
            }
        };

        if let Some(echo) = echo {
            let _ = echo.send(raw.clone());
        }

        let line = clean_line(&raw);
        if line.is_empty() {
            continue;
        }
        if sender.push(line).is_none() {
            tracing::debug!(source = %name, "Dispatcher gone, stopping source");
            return Ok(enqueued);
        }
        enqueued += 1;
    }
}

fn echo_lines(rx: &crossbeam_channel::Receiver<String>, gate: &OutputGate, mut out: Echo) {
    if !gate.wait() {
        return;
    }
    for raw in rx {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if writeln!(out, "{raw}").and_then(|()| out.flush()).is_err() {
            break;
        }
    }
}
