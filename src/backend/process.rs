//! Child process supervision for synchronous backends.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::LaunchContext;
use crate::job::{BackendKind, LogTail};

/// Exit state and captured output of a supervised child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Program or command line that was run.
    pub program: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: LogTail,
    pub stderr: LogTail,
    /// The process was killed because the job was cancelled.
    pub cancelled: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }

    /// Last lines of stdout then stderr, for error reports.
    pub fn output_tail(&self, lines: usize) -> String {
        let mut all: Vec<&str> = self.stdout.lines().collect();
        all.extend(self.stderr.lines());
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Spawns `cmd` and supervises it until exit or cancellation.
///
/// Lines containing `marker` are reported to the progress sink as they
/// arrive. On normal exit both pipes are read to EOF before returning; on
/// cancellation the child is killed and reading stops.
pub(crate) async fn run_to_completion(
    mut cmd: Command,
    program: &str,
    backend: BackendKind,
    ctx: &LaunchContext,
    marker: &str,
) -> std::io::Result<ProcessOutcome> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    debug!(job_id = %ctx.job_id, pid = ?child.id(), "Started {}", program);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    let mut outcome = ProcessOutcome {
        program: program.to_string(),
        exit_code: None,
        stdout: LogTail::default(),
        stderr: LogTail::default(),
        cancelled: false,
    };
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => {
                    if !marker.is_empty() && line.contains(marker) {
                        ctx.report(backend, "", &line);
                    }
                    outcome.stdout.push(line);
                }
                Ok(None) => out_open = false,
                Err(e) => {
                    warn!(job_id = %ctx.job_id, "Error reading stdout: {}", e);
                    out_open = false;
                }
            },
            line = err_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    if !marker.is_empty() && line.contains(marker) {
                        ctx.report(backend, "", &line);
                    }
                    outcome.stderr.push(line);
                }
                Ok(None) => err_open = false,
                Err(e) => {
                    warn!(job_id = %ctx.job_id, "Error reading stderr: {}", e);
                    err_open = false;
                }
            },
            _ = ctx.cancel.cancelled() => {
                outcome.cancelled = true;
                if let Err(e) = child.start_kill() {
                    warn!(job_id = %ctx.job_id, "Failed to kill {}: {}", program, e);
                }
                break;
            }
        }
    }

    let status = child.wait().await?;
    outcome.exit_code = status.code();
    debug!(
        job_id = %ctx.job_id,
        exit_code = ?outcome.exit_code,
        cancelled = outcome.cancelled,
        "{} exited",
        program
    );
    Ok(outcome)
}
