//! SSH transport.
//!
//! One [`SshSession`] wraps one multiplexed OpenSSH master connection: the
//! first command authenticates and every later command for the same job
//! reuses it through the control socket.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::shell::{CommandOutput, Shell};
use crate::config::SshConfig;
use crate::error::JobError;
use crate::job::{HostKeyPolicy, SshTarget};

/// Exit status the OpenSSH client reserves for its own failures.
pub(super) const SSH_ERROR_EXIT: i32 = 255;

/// How long the master connection outlives its last client.
const CONTROL_PERSIST: &str = "10m";

/// Persistent key-authenticated session to one host.
#[derive(Debug, Clone)]
pub struct SshSession {
    program: String,
    target: SshTarget,
    host_key_policy: HostKeyPolicy,
    connect_timeout: Duration,
    control_path: PathBuf,
}

impl SshSession {
    pub fn new(target: SshTarget, config: &SshConfig) -> Self {
        let host_key_policy = target.host_key_policy.unwrap_or(config.host_key_policy);
        let tag = Uuid::new_v4().simple().to_string();
        let control_path = std::env::temp_dir().join(format!("cdi-jobs-{}.sock", &tag[..12]));
        Self {
            program: config.ssh_program.clone(),
            target,
            host_key_policy,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            control_path,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// Client options shared by every invocation.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.host_key_policy.ssh_option()),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}", CONTROL_PERSIST),
        ];
        if let Some(key) = &self.target.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(port) = self.target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Builds a client command that runs `remote_command` on the host.
    pub fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.base_args())
            .arg(self.target.destination())
            .arg(remote_command);
        cmd
    }

    fn connection_error(&self, message: impl Into<String>) -> JobError {
        JobError::Connection {
            host: self.target.host.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Shell for SshSession {
    fn describe(&self) -> String {
        self.target.destination()
    }

    async fn connect(&self) -> Result<(), JobError> {
        let output = self.exec("true").await?;
        if !output.success() {
            return Err(self.connection_error(output.combined()));
        }
        info!(host = %self.target.host, "SSH session established");
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, JobError> {
        debug!(host = %self.target.host, "exec: {}", command);
        let output: CommandOutput = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.connection_error(format!("failed to start {}: {}", self.program, e)))?
            .into();
        if output.exit_code == Some(SSH_ERROR_EXIT) {
            return Err(self.connection_error(output.combined()));
        }
        Ok(output)
    }

    async fn close(&self) {
        let result = Command::new(&self.program)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) => debug!(host = %self.target.host, "SSH master closed: {}", status),
            Err(e) => warn!(host = %self.target.host, "Failed to close SSH master: {}", e),
        }
    }
}
