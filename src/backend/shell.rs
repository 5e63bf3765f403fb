//! Shell transports used to run scheduler commands.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::JobError;
use crate::job::BackendKind;

/// Captured result of a short shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }

    /// Converts a non-zero exit into an [`JobError::ExternalProcess`].
    pub fn check(self, backend: BackendKind, program: &str) -> Result<Self, JobError> {
        if self.success() {
            return Ok(self);
        }
        Err(JobError::ExternalProcess {
            backend,
            program: program.to_string(),
            exit_code: self.exit_code,
            output_tail: self.combined(),
        })
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs short command lines on the host that talks to the scheduler.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Where commands run, for logs and errors.
    fn describe(&self) -> String;

    /// Establishes the transport. Fails with a connection error before any job is launched.
    async fn connect(&self) -> Result<(), JobError> {
        Ok(())
    }

    /// Runs a command line and captures its output. A non-zero exit is not an error here.
    async fn exec(&self, command: &str) -> Result<CommandOutput, JobError>;

    /// Releases the transport.
    async fn close(&self) {}
}

/// Runs commands through a local shell (`bash -c`).
#[derive(Debug, Clone)]
pub struct LocalShell {
    shell: String,
}

impl LocalShell {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Builds a command running `command_line` under this shell.
    pub fn command(&self, command_line: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new("/bin/bash")
    }
}

#[async_trait]
impl Shell for LocalShell {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, JobError> {
        debug!(shell = %self.shell, "exec: {}", command);
        let output = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| JobError::ExternalProcess {
                backend: BackendKind::BatchLocal,
                program: self.shell.clone(),
                exit_code: None,
                output_tail: format!("failed to start: {}", e),
            })?;
        Ok(output.into())
    }
}

/// Quotes a word for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
