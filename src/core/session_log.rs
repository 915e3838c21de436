//! JSON-lines session log
//!
//! Each record carries a timestamp and the id of the session it belongs to,
//! so one file can hold several device runs.

use super::events::{EventSink, TestEvent};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Progress
    #[default]
    Info,
    /// Unexpected but not fatal
    Warn,
    /// Failure
    Error,
}

/// Payload of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordBody {
    /// Test notification
    Event(TestEvent),
    /// Free-form message
    Message {
        /// Message text
        message: String,
    },
}

/// One line of the session log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Wall-clock time of the record
    pub timestamp: DateTime<Local>,
    /// Session the record belongs to
    pub session: Uuid,
    /// Severity
    pub level: LogLevel,
    /// Payload
    #[serde(flatten)]
    pub body: RecordBody,
}

/// Appends [`LogRecord`]s to a `.jsonl` file
pub struct SessionLog {
    file: BufWriter<File>,
    path: PathBuf,
    session: Uuid,
    records: usize,
}

impl SessionLog {
    /// Open (or append to) a log file and start a session
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut log = Self {
            file: BufWriter::new(file),
            path,
            session: Uuid::new_v4(),
            records: 0,
        };
        log.write_session_start()?;
        Ok(log)
    }

    /// Create a timestamped log file inside `dir`
    pub fn create_in(dir: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Self::open(dir.as_ref().join(generate_log_filename("session")))
    }

    /// Begin a new session in the same file
    pub fn start_new_session(&mut self) -> io::Result<Uuid> {
        self.session = Uuid::new_v4();
        self.write_session_start()?;
        Ok(self.session)
    }

    /// Current session id
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Write a free-form message
    pub fn log_event(&mut self, message: &str, level: LogLevel) -> io::Result<()> {
        self.write(
            level,
            RecordBody::Message {
                message: message.to_string(),
            },
        )
    }

    fn write_session_start(&mut self) -> io::Result<()> {
        let message = format!("session started ({} v{})", crate::NAME, crate::VERSION);
        self.log_event(&message, LogLevel::Info)
    }

    fn write(&mut self, level: LogLevel, body: RecordBody) -> io::Result<()> {
        let record = LogRecord {
            timestamp: Local::now(),
            session: self.session,
            level,
            body,
        };
        serde_json::to_writer(&mut self.file, &record)?;
        self.file.write_all(b"\n")?;
        // Operators tail this file during a run.
        self.file.flush()?;
        self.records += 1;
        Ok(())
    }
}

impl EventSink for SessionLog {
    fn emit(&mut self, event: &TestEvent) {
        let level = if event.is_failure() {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        if let Err(e) = self.write(level, RecordBody::Event(event.clone())) {
            tracing::warn!(path = %self.path.display(), "Failed to write session log: {}", e);
        }
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.jsonl", prefix, timestamp)
}
