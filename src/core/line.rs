//! Device log lines

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single cleaned line of device console output.
///
/// Lines are immutable once queued. `seq` is the arrival position assigned by
/// the [`LineQueue`](super::queue::LineQueue); it is strictly increasing in
/// push order and is the only notion of time the dispatcher relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    seq: u64,
    text: String,
}

impl LogLine {
    /// Create a line with an explicit sequence number
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }

    /// Arrival position in the stream
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Line text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Case-sensitive substring match anywhere in the line
    pub fn contains(&self, pattern: &str) -> bool {
        self.text.contains(pattern)
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
