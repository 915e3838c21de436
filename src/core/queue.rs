//! Ordered hand-off queue between the line source and the dispatcher
//!
//! The queue is unbounded: a push never blocks and never drops a line.
//! Losing device output is worse than memory growth during a test run.
//! End of stream is signalled by dropping every [`LineSender`]; once the
//! queue has drained, [`LineQueue::pull`] returns `None`.

use super::line::LogLine;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Result of a pull with a deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pulled {
    /// Next line in arrival order
    Line(LogLine),
    /// No line arrived before the deadline
    TimedOut,
    /// All producers are gone and the queue is empty
    Closed,
}

/// Create a connected producer/consumer pair
pub fn channel() -> (LineSender, LineQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let sender = LineSender {
        inner: Arc::new(SenderInner {
            tx,
            next_seq: Mutex::new(0),
        }),
    };
    (sender, LineQueue { rx })
}

struct SenderInner {
    tx: Sender<LogLine>,
    // Held across the send so sequence numbers match channel order even
    // when the sender is cloned.
    next_seq: Mutex<u64>,
}

/// Producer half of the queue
#[derive(Clone)]
pub struct LineSender {
    inner: Arc<SenderInner>,
}

impl LineSender {
    /// Enqueue a line and return its sequence number.
    ///
    /// Returns `None` only when the consumer has been dropped, in which case
    /// nobody is left to observe the line.
    pub fn push(&self, text: impl Into<String>) -> Option<u64> {
        let mut next_seq = self.inner.next_seq.lock();
        let seq = *next_seq;
        self.inner.tx.send(LogLine::new(seq, text)).ok()?;
        *next_seq += 1;
        Some(seq)
    }

    /// Number of lines pushed so far
    pub fn pushed(&self) -> u64 {
        *self.inner.next_seq.lock()
    }
}

impl std::fmt::Debug for LineSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSender")
            .field("pushed", &self.pushed())
            .finish()
    }
}

/// Consumer half of the queue
#[derive(Debug)]
pub struct LineQueue {
    rx: Receiver<LogLine>,
}

impl LineQueue {
    /// Block until the next line is available.
    ///
    /// Returns `None` once every sender has been dropped and all queued
    /// lines have been delivered.
    pub fn pull(&self) -> Option<LogLine> {
        self.rx.recv().ok()
    }

    /// Block for at most `timeout` waiting for the next line
    pub fn pull_timeout(&self, timeout: Duration) -> Pulled {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Pulled::Line(line),
            Err(RecvTimeoutError::Timeout) => Pulled::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pulled::Closed,
        }
    }

    /// Lines waiting to be pulled
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// No lines waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
