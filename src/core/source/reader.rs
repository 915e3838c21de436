//! Buffered reader source (stdin, captured logs)

use super::{LineSource, SourceError};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Reads lines from any [`BufRead`]
pub struct ReaderSource<R> {
    name: String,
    reader: R,
}

impl<R: BufRead + Send + 'static> ReaderSource<R> {
    /// Wrap a reader
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
        }
    }
}

impl ReaderSource<BufReader<File>> {
    /// Replay a captured console log
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SourceError::PortNotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => SourceError::PermissionDenied(path.display().to_string()),
            _ => SourceError::IoError(e),
        })?;
        Ok(Self::new(path.display().to_string(), BufReader::new(file)))
    }
}

impl ReaderSource<BufReader<io::Stdin>> {
    /// Read device output piped into stdin
    pub fn stdin() -> Self {
        Self::new("stdin", BufReader::new(io::stdin()))
    }
}

impl<R: BufRead + Send + 'static> LineSource for ReaderSource<R> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        let mut buf = Vec::new();
        if self.reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}
