//! Execution backends.
//!
//! Each backend knows how to:
//! 1. Launch a job from its [`JobSpec`]
//! 2. Poll it, when launch returns before the work is done
//! 3. Ask the compute resource to cancel it

mod batch;
mod local;
mod process;
mod remote;
pub mod script;
mod shell;
mod ssh;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

pub use batch::{parse_state_token, parse_submission_output, BatchScheduler};
pub use local::LocalSubprocess;
pub use process::ProcessOutcome;
pub use remote::RemoteShell;
pub use shell::{shell_quote, CommandOutput, LocalShell, Shell};
pub use ssh::SshSession;
pub use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::error::JobError;
use crate::job::{BackendKind, IntermediateFiles, Job, JobSpec, PollRecord};
use crate::progress::{ProgressSink, ProgressUpdate, TracingProgress};

/// Per-launch context handed to a backend.
#[derive(Clone)]
pub struct LaunchContext {
    pub job_id: Uuid,
    /// File name of the input file inside the working directory.
    pub input_file: String,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
}

impl LaunchContext {
    pub fn new(job_id: Uuid, input_file: impl Into<String>) -> Self {
        Self {
            job_id,
            input_file: input_file.into(),
            progress: Arc::new(TracingProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn report(&self, backend: BackendKind, backend_id: &str, line: &str) {
        self.progress.on_progress(ProgressUpdate {
            job_id: self.job_id,
            backend,
            backend_id: backend_id.to_string(),
            line: line.to_string(),
        });
    }
}

impl fmt::Debug for LaunchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchContext")
            .field("job_id", &self.job_id)
            .field("input_file", &self.input_file)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// What a backend's `launch` produced.
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    /// Accepted by an asynchronous backend; the job must be polled.
    Submitted {
        backend_id: String,
        files: IntermediateFiles,
    },
    /// A synchronous backend ran the job to its end.
    Finished {
        outcome: ProcessOutcome,
        files: IntermediateFiles,
    },
}

/// Capability set shared by all execution backends.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launches the job. Synchronous backends return only once the work has ended.
    async fn launch(&self, spec: &JobSpec, ctx: &LaunchContext)
        -> Result<LaunchOutcome, JobError>;

    /// Queries the job's current status. Only asynchronous backends support this.
    async fn poll(&self, job: &Job) -> Result<PollRecord, JobError> {
        Err(JobError::InvalidState {
            operation: "poll",
            job_id: job.display_id(),
            status: job.status(),
        })
    }

    /// Requests termination. The effect is confirmed by a later poll.
    async fn cancel(&self, job: &Job) -> Result<(), JobError>;

    /// Releases transports once the job is terminal.
    async fn release(&self) {}
}

/// Builds the backend for a validated spec.
pub fn create_backend(
    spec: &JobSpec,
    config: &OrchestratorConfig,
) -> Result<Arc<dyn Backend>, JobError> {
    let ssh_session = || -> Result<SshSession, JobError> {
        let target = spec.ssh.clone().ok_or_else(|| {
            JobError::validation(format!("backend '{}' requires an ssh target", spec.backend))
        })?;
        Ok(SshSession::new(target, &config.ssh))
    };

    let backend: Arc<dyn Backend> = match spec.backend {
        BackendKind::Local => Arc::new(LocalSubprocess::new(config)),
        BackendKind::BatchLocal => Arc::new(BatchScheduler::new(
            BackendKind::BatchLocal,
            Arc::new(LocalShell::new(config.local.shell.clone())),
            config,
        )),
        BackendKind::BatchRemote => Arc::new(BatchScheduler::new(
            BackendKind::BatchRemote,
            Arc::new(ssh_session()?),
            config,
        )),
        BackendKind::RemoteShell => Arc::new(RemoteShell::new(ssh_session()?, config)),
    };
    Ok(backend)
}
