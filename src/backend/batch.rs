//! Batch scheduler backend (SLURM).
//!
//! Scheduler commands run through a [`Shell`]: the local shell for
//! `batch-local`, an SSH session for `batch-remote`. The working directory is
//! expected on a filesystem shared by both ends, so the submission script is
//! written locally and read by the scheduler from the same path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::script::{load_template, render_script, ScriptContext};
use super::shell::{shell_quote, Shell};
use super::{Backend, LaunchContext, LaunchOutcome};
use crate::config::{BatchConfig, OrchestratorConfig};
use crate::error::JobError;
use crate::job::{BackendKind, IntermediateFiles, Job, JobSpec, JobStatus, PollRecord};

/// Attempts at reading the job log for progress during one poll.
const LOG_READ_ATTEMPTS: u32 = 3;

/// Extracts the job id from `sbatch` output.
///
/// The accepted shape is `Submitted batch job <digits>`: the id is the fourth
/// whitespace-delimited token. Anything else is a parse failure.
pub fn parse_submission_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["Submitted", "batch", "job", id, ..]
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) =>
            {
                Some(id.to_string())
            }
            _ => None,
        }
    })
}

/// Maps `sacct` output to the raw state token and its canonical status.
///
/// Only the first token of the first non-empty line is read. Unknown tokens
/// and empty output map to `None`.
pub fn parse_state_token(output: &str) -> (String, Option<JobStatus>) {
    let raw = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or("")
        .to_string();
    let status = match raw.trim_end_matches('+') {
        "PENDING" => Some(JobStatus::Pending),
        "RUNNING" => Some(JobStatus::Running),
        "COMPLETED" => Some(JobStatus::Completed),
        "CANCELLED" => Some(JobStatus::Cancelled),
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" => Some(JobStatus::Failed),
        _ => None,
    };
    (raw, status)
}

/// Submits a rendered script to the scheduler and tracks it by job id.
pub struct BatchScheduler {
    kind: BackendKind,
    shell: Arc<dyn Shell>,
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(kind: BackendKind, shell: Arc<dyn Shell>, config: &OrchestratorConfig) -> Self {
        Self {
            kind,
            shell,
            config: config.batch.clone(),
        }
    }

    fn submit_command(&self, spec: &JobSpec) -> String {
        format!(
            "cd {} && {} {}",
            shell_quote(&spec.working_dir.display().to_string()),
            self.config.submit_command,
            shell_quote(&self.config.script_name)
        )
    }

    fn status_command(&self, backend_id: &str) -> String {
        format!(
            "{} -j {} --format=State --noheader",
            self.config.status_command,
            shell_quote(backend_id)
        )
    }

    fn progress_command(&self, job: &Job) -> String {
        format!(
            "cd {} && grep {} {}",
            shell_quote(&job.spec().working_dir.display().to_string()),
            shell_quote(&self.config.progress_marker),
            shell_quote(&self.config.log_file_name(job.backend_id()))
        )
    }

    /// Progress lines not yet reported for `job`.
    ///
    /// Transport failures are retried up to [`LOG_READ_ATTEMPTS`] times; after
    /// that the poll goes on without progress. A `grep` without matches (the
    /// log may not exist yet) yields nothing.
    async fn read_progress(&self, job: &Job) -> Vec<String> {
        let command = self.progress_command(job);
        for attempt in 1..=LOG_READ_ATTEMPTS {
            match self.shell.exec(&command).await {
                Ok(output) if output.success() => {
                    return output
                        .stdout
                        .lines()
                        .skip(job.progress_seen())
                        .map(str::to_string)
                        .collect();
                }
                Ok(_) => return Vec::new(),
                Err(e) if e.is_retryable() && attempt < LOG_READ_ATTEMPTS => {
                    debug!(
                        backend_id = %job.backend_id(),
                        attempt,
                        "Job log read failed, retrying: {}",
                        e
                    );
                }
                Err(e) => {
                    warn!(
                        backend_id = %job.backend_id(),
                        attempts = attempt,
                        "Could not read job log: {}",
                        e
                    );
                    break;
                }
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl Backend for BatchScheduler {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn launch(
        &self,
        spec: &JobSpec,
        ctx: &LaunchContext,
    ) -> Result<LaunchOutcome, JobError> {
        self.shell.connect().await?;

        let template_id = spec
            .resources
            .as_ref()
            .and_then(|r| r.template.as_deref())
            .or(self.config.template.as_deref());
        let template = load_template(template_id)?;
        let script_ctx = ScriptContext::from_spec(spec, &self.config, &ctx.input_file);
        let script = render_script(&template, &script_ctx)?;
        let script_path = spec.working_dir.join(&self.config.script_name);
        tokio::fs::write(&script_path, script).await.map_err(|e| {
            JobError::validation(format!("cannot write {}: {}", script_path.display(), e))
        })?;

        let command = self.submit_command(spec);
        let attempts = self.config.submit_attempts.max(1);
        let mut last_output = String::new();
        for attempt in 1..=attempts {
            debug!(job_id = %ctx.job_id, attempt, host = %self.shell.describe(), "exec: {}", command);
            let output = self.shell.exec(&command).await?;
            last_output = output.combined();
            if let Some(backend_id) = parse_submission_output(&output.stdout) {
                info!(
                    job_id = %ctx.job_id,
                    backend = %self.kind,
                    backend_id = %backend_id,
                    "Submitted batch job"
                );
                let files = IntermediateFiles::default()
                    .with_script(script_path)
                    .with_log(spec.working_dir.join(self.config.log_file_name(&backend_id)));
                return Ok(LaunchOutcome::Submitted { backend_id, files });
            }
            warn!(
                job_id = %ctx.job_id,
                attempt,
                max_attempts = attempts,
                "Job not submitted yet: {}",
                last_output
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.submit_retry_delay()).await;
            }
        }

        Err(JobError::Submission {
            backend: self.kind,
            message: format!("no job id in submission output after {} attempts", attempts),
            output: last_output,
        })
    }

    async fn poll(&self, job: &Job) -> Result<PollRecord, JobError> {
        let output = self
            .shell
            .exec(&self.status_command(job.backend_id()))
            .await?
            .check(self.kind, &self.config.status_command)?;
        let (raw, status) = parse_state_token(&output.stdout);
        debug!(
            backend_id = %job.backend_id(),
            raw_status = %raw,
            status = ?status,
            "Polled batch job"
        );

        let mut record = PollRecord::new(raw, status);
        if status == Some(JobStatus::Running) {
            record = record.with_fragment(self.read_progress(job).await);
        }
        Ok(record)
    }

    async fn cancel(&self, job: &Job) -> Result<(), JobError> {
        let command = format!(
            "{} {}",
            self.config.cancel_command,
            shell_quote(job.backend_id())
        );
        info!(backend_id = %job.backend_id(), "Cancelling batch job");
        self.shell
            .exec(&command)
            .await?
            .check(self.kind, &self.config.cancel_command)?;
        Ok(())
    }

    async fn release(&self) {
        self.shell.close().await;
    }
}
