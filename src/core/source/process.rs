//! Child process source
//!
//! Used for transports that are exposed through a helper program, e.g. a
//! debug probe's RTT client printing the target's log channel on stdout.

use super::{LineSource, SourceError};
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};

/// Default RTT client program
pub const RTT_CLIENT: &str = "JLinkRTTClient";

/// Reads lines from a child process's stdout
pub struct ProcessSource {
    program: String,
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl ProcessSource {
    /// Spawn `program` with `args`
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SourceError::SpawnFailed(program.to_string(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::ConnectionFailed(format!("{program}: stdout not captured")))?;

        tracing::info!(program, pid = child.id(), "Started line source process");
        Ok(Self {
            program: program.to_string(),
            child,
            stdout: BufReader::new(stdout),
        })
    }

    /// Start the debug probe's RTT client
    pub fn rtt() -> Result<Self, SourceError> {
        Self::spawn(RTT_CLIENT, std::iter::empty::<&str>())
    }
}

impl LineSource for ProcessSource {
    fn name(&self) -> String {
        format!("{} (pid {})", self.program, self.child.id())
    }

    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        let mut buf = Vec::new();
        if self.stdout.read_until(b'\n', &mut buf)? == 0 {
            let status = self.child.wait()?;
            tracing::info!(program = %self.program, %status, "Line source process exited");
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_reads_child_stdout() {
        let mut source = ProcessSource::spawn("sh", ["-c", "printf 'AQSV Started\\nPOST OK\\n'"]).unwrap();
        assert_eq!(source.read_line().unwrap().as_deref(), Some("AQSV Started\n"));
        assert_eq!(source.read_line().unwrap().as_deref(), Some("POST OK\n"));
        assert_eq!(source.read_line().unwrap(), None);
    }

    #[test]
    fn test_missing_program() {
        let err = ProcessSource::spawn("definitely-not-a-real-rtt-client", std::iter::empty::<&str>())
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::SpawnFailed(_, _)));
    }
}
