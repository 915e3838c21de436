//! Firmware build and flash step
//!
//! Runs once before device output is displayed. A failed build is fatal:
//! the runner never starts dispatching lines from a device that was not
//! flashed.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Build step errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// The build command could not be started
    #[error("Failed to start build: {0}")]
    Spawn(#[from] std::io::Error),

    /// The build command exited unsuccessfully
    #[error("Build or flashing failed (exit code {code:?}): {stderr}")]
    Failed {
        /// Exit code, absent when killed by a signal
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The build did not finish in time
    #[error("Build timed out after {0} seconds")]
    Timeout(u64),
}

/// Build/flash collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Description for logs
    fn name(&self) -> String;

    /// Build and flash; returns once the device is ready to boot
    async fn execute(&self) -> Result<(), BuildError>;
}

/// Skips building (device already flashed, or replaying a log)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBuild;

#[async_trait]
impl BuildStep for NoBuild {
    fn name(&self) -> String {
        "none".to_string()
    }

    async fn execute(&self) -> Result<(), BuildError> {
        Ok(())
    }
}

/// Runs a shell script, streaming its stdout to the console
#[derive(Debug, Clone)]
pub struct ShellBuild {
    script: String,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ShellBuild {
    /// Create a build running `bash -c <script>`
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Run the script from this directory
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill the build after this long
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self) -> Result<(), BuildError> {
        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                println!("{line}");
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !stderr.trim().is_empty() {
            tracing::warn!("Build error output:\n{}", stderr.trim_end());
        }

        if status.success() {
            tracing::info!("Build and firmware flash completed successfully");
            Ok(())
        } else {
            Err(BuildError::Failed {
                code: status.code(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl BuildStep for ShellBuild {
    fn name(&self) -> String {
        match &self.working_dir {
            Some(dir) => format!("bash -c '{}' in {}", self.script, dir.display()),
            None => format!("bash -c '{}'", self.script),
        }
    }

    async fn execute(&self) -> Result<(), BuildError> {
        tracing::info!(build = %self.name(), "Starting build");
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run())
                .await
                .map_err(|_| BuildError::Timeout(limit.as_secs()))?,
            None => self.run().await,
        }
    }
}
