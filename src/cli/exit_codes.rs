//! CLI Exit Codes
//!
//! Exit codes for CI pipelines driving hardware test runs.

use crate::config::ConfigError;
use crate::core::dispatcher::{DispatchReport, DispatcherPhase};
use crate::core::runner::{RunError, RunOutcome};
use crate::core::source::SourceError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Build or flash failed
    pub const BUILD_FAILED: u8 = 18;

    /// A test failed
    pub const TEST_FAILED: u8 = 19;

    /// No test triggered within the idle timeout
    pub const IDLE_TIMEOUT: u8 = 20;

    /// Device output ended with a test still running
    pub const INCOMPLETE: u8 = 21;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a summary
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Interpret a finished dispatch
    pub fn from_report(report: &DispatchReport) -> Self {
        if let Some(failure) = &report.failure {
            return Self::Error(
                ExitCodes::TEST_FAILED,
                format!("{} failed: {}", failure.test, failure.reason),
            );
        }
        if report.phase == DispatcherPhase::HaltedOnIdleTimeout {
            return Self::Error(ExitCodes::IDLE_TIMEOUT, "No test triggered before idle timeout".into());
        }
        if let Some(test) = &report.interrupted {
            return Self::Error(
                ExitCodes::INCOMPLETE,
                format!("Device output ended while {test} was running"),
            );
        }
        Self::success_with_message(format!(
            "{} test(s) completed: {}",
            report.completed.len(),
            report.completed.join(", ")
        ))
    }

    /// Interpret a finished run
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        match (&outcome.source_error, Self::from_report(&outcome.report)) {
            (Some(e), Self::Success(_)) => Self::from(e),
            (_, result) => result,
        }
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&SourceError> for CliResult {
    fn from(err: &SourceError) -> Self {
        let code = match err {
            SourceError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            SourceError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            SourceError::ConnectionFailed(_) | SourceError::IoError(_) => ExitCodes::CONNECTION_FAILED,
            SourceError::SpawnFailed(_, _) => ExitCodes::FILE_NOT_FOUND,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<&RunError> for CliResult {
    fn from(err: &RunError) -> Self {
        let code = match err {
            RunError::Build(_) => ExitCodes::BUILD_FAILED,
            RunError::Dispatch(_) => ExitCodes::CONFIG_ERROR,
            RunError::Worker(_) => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        11 => "Operation cancelled",
        14 => "Port not found",
        18 => "Build or flash failed",
        19 => "Test failed",
        20 => "Idle timeout",
        21 => "Device output ended mid-test",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 6, 7, 8, 11, 14, 18, 19, 20, 21, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
