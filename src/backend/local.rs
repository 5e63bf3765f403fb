//! Same-host subprocess backend.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::run_to_completion;
use super::{Backend, LaunchContext, LaunchOutcome, LocalShell};
use crate::config::OrchestratorConfig;
use crate::error::JobError;
use crate::job::{BackendKind, IntermediateFiles, Job, JobSpec};

/// Runs the phasing program as a child process in the working directory.
///
/// `launch` blocks until the child exits; there is nothing to poll.
#[derive(Debug, Clone)]
pub struct LocalSubprocess {
    program: String,
    shell: LocalShell,
    progress_marker: String,
}

impl LocalSubprocess {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            program: config.local.program.clone(),
            shell: LocalShell::new(config.local.shell.clone()),
            progress_marker: config.batch.progress_marker.clone(),
        }
    }

    fn build_command(&self, spec: &JobSpec, ctx: &LaunchContext) -> (Command, String) {
        let (mut cmd, command_line) = match &spec.command {
            Some(line) => (self.shell.command(line), line.clone()),
            None => {
                let mut cmd = Command::new(&self.program);
                cmd.arg(&ctx.input_file);
                (cmd, format!("{} {}", self.program, ctx.input_file))
            }
        };
        cmd.current_dir(&spec.working_dir);
        (cmd, command_line)
    }
}

#[async_trait]
impl Backend for LocalSubprocess {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn launch(
        &self,
        spec: &JobSpec,
        ctx: &LaunchContext,
    ) -> Result<LaunchOutcome, JobError> {
        let (cmd, command_line) = self.build_command(spec, ctx);
        info!(
            job_id = %ctx.job_id,
            working_dir = %spec.working_dir.display(),
            "Running: {}",
            command_line
        );
        let outcome = run_to_completion(cmd, &command_line, BackendKind::Local, ctx, &self.progress_marker)
            .await
            .map_err(|e| JobError::ExternalProcess {
                backend: BackendKind::Local,
                program: command_line.clone(),
                exit_code: None,
                output_tail: format!("failed to start: {}", e),
            })?;
        Ok(LaunchOutcome::Finished {
            outcome,
            files: IntermediateFiles::default(),
        })
    }

    async fn cancel(&self, job: &Job) -> Result<(), JobError> {
        // the child is owned by the launching task; it is stopped via the cancel token
        debug!(job_id = %job.id(), "Local job has no backend-side cancel");
        Ok(())
    }
}
