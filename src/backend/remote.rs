//! Direct SSH execution backend.

use async_trait::async_trait;
use tracing::info;

use super::process::run_to_completion;
use super::shell::{shell_quote, Shell};
use super::ssh::SSH_ERROR_EXIT;
use super::{Backend, LaunchContext, LaunchOutcome, SshSession};
use crate::config::{OrchestratorConfig, RemoteConfig};
use crate::error::JobError;
use crate::job::{BackendKind, IntermediateFiles, Job, JobSpec};

/// Runs the phasing program on a remote host inside one SSH session.
///
/// The session lives exactly as long as the job; there is nothing to poll.
pub struct RemoteShell {
    session: SshSession,
    config: RemoteConfig,
    progress_marker: String,
}

impl RemoteShell {
    pub fn new(session: SshSession, config: &OrchestratorConfig) -> Self {
        Self {
            session,
            config: config.remote.clone(),
            progress_marker: config.batch.progress_marker.clone(),
        }
    }

    /// Log file written next to the inputs by `tee`.
    pub fn log_file_name(&self) -> String {
        self.config.log_file_name(self.session.host())
    }

    /// Command line run on the remote host.
    pub fn command_line(&self, spec: &JobSpec, input_file: &str) -> String {
        let mut steps = vec!["set -o pipefail".to_string()];
        if let Some(setup) = &self.config.setup_command {
            steps.push(setup.clone());
        }
        steps.push(format!(
            "cd {}",
            shell_quote(&spec.working_dir.display().to_string())
        ));
        match &spec.command {
            Some(command) => steps.push(command.clone()),
            None => steps.push(format!(
                "{} {} 2>&1 | tee {}",
                self.config.program,
                shell_quote(input_file),
                shell_quote(&self.log_file_name())
            )),
        }
        format!("bash -c {}", shell_quote(&steps.join("; ")))
    }
}

#[async_trait]
impl Backend for RemoteShell {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteShell
    }

    async fn launch(
        &self,
        spec: &JobSpec,
        ctx: &LaunchContext,
    ) -> Result<LaunchOutcome, JobError> {
        self.session.connect().await?;

        let line = self.command_line(spec, &ctx.input_file);
        let summary = spec
            .command
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.config.program, ctx.input_file));
        info!(
            job_id = %ctx.job_id,
            host = %self.session.describe(),
            "Running remotely: {}",
            summary
        );

        let result = run_to_completion(
            self.session.command(&line),
            &summary,
            BackendKind::RemoteShell,
            ctx,
            &self.progress_marker,
        )
        .await;
        self.session.close().await;

        let outcome = result.map_err(|e| JobError::Connection {
            host: self.session.host().to_string(),
            message: format!("failed to start ssh: {}", e),
        })?;
        if outcome.exit_code == Some(SSH_ERROR_EXIT) {
            return Err(JobError::Connection {
                host: self.session.host().to_string(),
                message: outcome.output_tail(20),
            });
        }

        let mut files = IntermediateFiles::default();
        if spec.command.is_none() {
            files = files.with_log(spec.working_dir.join(self.log_file_name()));
        }
        Ok(LaunchOutcome::Finished { outcome, files })
    }

    async fn cancel(&self, job: &Job) -> Result<(), JobError> {
        info!(job_id = %job.id(), host = %self.session.host(), "Closing remote session");
        self.session.close().await;
        Ok(())
    }

    async fn release(&self) {
        self.session.close().await;
    }
}
