//! Serial port source

use super::{LineSource, SourceError};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

/// Default device console speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Reads device console lines from a serial port
pub struct SerialSource {
    port_name: String,
    baud_rate: u32,
    reader: BufReader<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialSource {
    /// Open a serial port (8N1, no flow control)
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, SourceError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => SourceError::PortNotFound(port.to_string()),
                serialport::ErrorKind::Io(io_kind) => match io_kind {
                    io::ErrorKind::NotFound => SourceError::PortNotFound(port.to_string()),
                    io::ErrorKind::PermissionDenied => {
                        SourceError::PermissionDenied(port.to_string())
                    }
                    _ => SourceError::ConnectionFailed(e.to_string()),
                },
                _ => SourceError::ConnectionFailed(e.to_string()),
            })?;

        tracing::info!(port, baud_rate, "Serial port opened");
        Ok(Self {
            port_name: port.to_string(),
            baud_rate,
            reader: BufReader::new(handle),
            pending: Vec::with_capacity(256),
        })
    }

    /// Handle for sending console commands to the device
    pub fn commander(&self) -> Result<SerialCommander, SourceError> {
        let port = self
            .reader
            .get_ref()
            .try_clone()
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;
        Ok(SerialCommander {
            port_name: self.port_name.clone(),
            port: Mutex::new(port),
        })
    }

    fn take_pending(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

impl LineSource for SerialSource {
    fn name(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }

    fn read_line(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            // read_until keeps partial data in `pending` across timeouts.
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) if self.pending.is_empty() => return Ok(None),
                Ok(0) => return Ok(Some(self.take_pending())),
                Ok(_) if self.pending.ends_with(b"\n") => return Ok(Some(self.take_pending())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SourceError::IoError(e)),
            }
        }
    }
}

/// Writes commands to the device console
pub struct SerialCommander {
    port_name: String,
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialCommander {
    /// Send a newline-terminated command
    pub fn send_command(&self, command: &str) -> Result<(), SourceError> {
        let mut port = self.port.lock();
        port.write_all(format!("{command}\n").as_bytes())?;
        port.flush()?;
        tracing::info!(port = %self.port_name, command, "Sent command");
        Ok(())
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, SourceError> {
    serialport::available_ports().map_err(|e| SourceError::IoError(e.into()))
}
