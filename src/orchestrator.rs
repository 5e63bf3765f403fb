//! Job orchestrator.
//!
//! [`JobOrchestrator`] is the entry point callers use:
//!
//! - `submit`: validate a spec, write the input file, launch on the backend
//!   selected by the spec's [`BackendKind`]
//! - `await_completion`: poll asynchronous jobs to a terminal state and build
//!   the [`JobResult`]
//! - `cancel`: ask the backend to stop a non-terminal job
//! - `cleanup`: remove intermediate files, never result artifacts
//! - `spawn`: run submit and await on a separate tokio task
//!
//! Terminal `failed` and `cancelled` states are returned as results, not
//! errors. Errors are reserved for broken operation contracts: invalid
//! specs, unreachable hosts, unparseable submissions, misuse of a job's
//! state and timeouts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::{clear_matching, discover_artifacts, ArtifactPattern};
use crate::backend::{create_backend, Backend, CancellationToken, LaunchContext, LaunchOutcome};
use crate::config::{EnvDefaults, OrchestratorConfig};
use crate::error::JobError;
use crate::job::{BackendKind, Failure, Job, JobResult, JobSpec, JobStatus};
use crate::monitor::JobMonitor;
use crate::progress::{ProgressSink, TracingProgress};

/// Lines of output attached to an external process failure.
const FAILURE_TAIL_LINES: usize = 20;

/// Invoked once per job, when its result is first built.
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, result: &JobResult);
}

/// Which intermediate files `cleanup` removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub remove_input_file: bool,
    pub remove_script: bool,
    pub remove_logs: bool,
}

impl CleanupPolicy {
    /// Keeps every file.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// Removes every intermediate file.
    pub fn remove_all() -> Self {
        Self {
            remove_input_file: true,
            remove_script: true,
            remove_logs: true,
        }
    }

    pub fn with_input_file(mut self, remove: bool) -> Self {
        self.remove_input_file = remove;
        self
    }

    pub fn with_script(mut self, remove: bool) -> Self {
        self.remove_script = remove;
        self
    }

    pub fn with_logs(mut self, remove: bool) -> Self {
        self.remove_logs = remove;
        self
    }
}

/// How a spawned job's task ended.
#[derive(Debug)]
pub enum JobTaskOutcome {
    /// The job is terminal and its result is cached on it.
    Finished(Job),
    /// Waiting stopped before a terminal state, e.g. on timeout. The job
    /// still runs on its backend; pass it to `await_completion` or `cancel`.
    Unfinished { job: Job, error: JobError },
}

impl JobTaskOutcome {
    pub fn job(&self) -> &Job {
        match self {
            JobTaskOutcome::Finished(job) | JobTaskOutcome::Unfinished { job, .. } => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            JobTaskOutcome::Finished(job) | JobTaskOutcome::Unfinished { job, .. } => job,
        }
    }
}

/// Handle to a job running on its own task.
pub struct JobTask {
    id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<Result<JobTaskOutcome, JobError>>,
}

impl JobTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cancellation. The task still ends with a result.
    ///
    /// Only effective while the task runs; once it has returned an
    /// unfinished job, cancel through [`JobOrchestrator::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job, usable after `join` has taken the task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the job's result. An unfinished job's error is returned as is.
    pub async fn join(self) -> Result<JobResult, JobError> {
        match self.join_job().await? {
            JobTaskOutcome::Finished(job) => {
                job.result().cloned().ok_or_else(|| JobError::InvalidState {
                    operation: "join",
                    job_id: job.display_id(),
                    status: job.status(),
                })
            }
            JobTaskOutcome::Unfinished { error, .. } => Err(error),
        }
    }

    /// Waits for the task and hands back the job, terminal or not.
    ///
    /// Errors only when the job could not be launched.
    pub async fn join_job(self) -> Result<JobTaskOutcome, JobError> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(JobError::InvalidState {
                operation: "join",
                job_id: self.id.to_string(),
                status: JobStatus::Cancelled,
            }),
        }
    }
}

/// Selects backends, launches jobs and aggregates their results.
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    env: EnvDefaults,
    progress: Arc<dyn ProgressSink>,
    hook: Option<Arc<dyn CompletionHook>>,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl JobOrchestrator {
    /// Creates an orchestrator using the process environment for SSH defaults.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            env: EnvDefaults::from_env(),
            progress: Arc::new(TracingProgress),
            hook: None,
            backends: HashMap::new(),
        }
    }

    pub fn with_env_defaults(mut self, env: EnvDefaults) -> Self {
        self.env = env;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_completion_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Uses `backend` for every job of `kind` instead of building one from the spec.
    pub fn with_backend(mut self, kind: BackendKind, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Launches a job.
    ///
    /// Asynchronous backends return a `submitted` job; synchronous ones
    /// return a terminal job whose result is already built.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job, JobError> {
        self.launch(spec, Uuid::new_v4(), CancellationToken::new()).await
    }

    /// Waits until the job is terminal and returns its result.
    ///
    /// Calling this again on a terminal job returns the cached result
    /// without querying the backend. On timeout the job is left running.
    pub async fn await_completion(
        &self,
        job: &mut Job,
        timeout: Option<Duration>,
    ) -> Result<JobResult, JobError> {
        if let Some(result) = &job.result {
            return Ok(result.clone());
        }
        if !job.is_terminal() {
            self.monitor(job, timeout, &CancellationToken::new()).await?;
        }
        Ok(self.finalize(job).await)
    }

    /// Asks the backend to cancel a non-terminal job.
    ///
    /// The job becomes `cancelled` only once a later poll confirms it.
    pub async fn cancel(&self, job: &mut Job) -> Result<(), JobError> {
        if job.is_terminal() {
            return Err(JobError::InvalidState {
                operation: "cancel",
                job_id: job.display_id(),
                status: job.status(),
            });
        }
        info!(job_id = %job.id(), backend_id = %job.backend_id(), "Cancelling job");
        let backend = job.backend.clone();
        backend.cancel(job).await?;
        job.cancel_requested = true;
        Ok(())
    }

    /// Removes intermediate files according to `policy`, returning the removed paths.
    pub fn cleanup(&self, job: &Job, policy: &CleanupPolicy) -> Result<Vec<PathBuf>, JobError> {
        if !job.is_terminal() {
            return Err(JobError::InvalidState {
                operation: "cleanup",
                job_id: job.display_id(),
                status: job.status(),
            });
        }

        let files = job.files();
        let mut candidates: Vec<&Path> = Vec::new();
        if policy.remove_input_file {
            candidates.extend(files.input_file.as_deref());
        }
        if policy.remove_script {
            candidates.extend(files.script.as_deref());
        }
        if policy.remove_logs {
            candidates.extend(files.logs.iter().map(PathBuf::as_path));
        }

        let protected = self
            .result_patterns(job.spec())
            .iter()
            .map(|p| ArtifactPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let artifacts = job.result().map(|r| r.artifacts.as_slice()).unwrap_or(&[]);
        let mut removed = Vec::new();
        for path in candidates {
            if is_protected(path, &job.spec().working_dir, &protected, artifacts) {
                debug!("Keeping result artifact {}", path.display());
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => removed.push(path.to_path_buf()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        info!(job_id = %job.id(), removed = removed.len(), "Cleaned up job files");
        Ok(removed)
    }

    /// Runs submit and await on a new task.
    ///
    /// A job that stops being awaited before it is terminal comes back as
    /// [`JobTaskOutcome::Unfinished`] so the caller keeps its handle.
    pub fn spawn(self: &Arc<Self>, spec: JobSpec, timeout: Option<Duration>) -> JobTask {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut job = this.launch(spec, id, token.clone()).await?;
            if !job.is_terminal() {
                if let Err(error) = this.monitor(&mut job, timeout, &token).await {
                    return Ok(JobTaskOutcome::Unfinished { job, error });
                }
            }
            this.finalize(&mut job).await;
            Ok::<_, JobError>(JobTaskOutcome::Finished(job))
        });
        JobTask { id, cancel, handle }
    }

    #[instrument(skip(self, spec, cancel), fields(backend = %spec.backend))]
    async fn launch(
        &self,
        spec: JobSpec,
        id: Uuid,
        cancel: CancellationToken,
    ) -> Result<Job, JobError> {
        let spec = spec.with_env_defaults(&self.env);
        spec.validate()?;
        spec.prepare_working_dir()?;
        let backend = self.backend_for(&spec)?;

        if spec.clear_previous_results {
            let removed = clear_matching(&spec.working_dir, &self.config.artifacts.clear_patterns)?;
            info!(job_id = %id, removed = removed.len(), "Cleared former results");
        }

        let input_path = spec.working_dir.join(&self.config.input_file_name);
        tokio::fs::write(&input_path, spec.parameters.to_input_file())
            .await
            .map_err(|e| {
                JobError::validation(format!("cannot write {}: {}", input_path.display(), e))
            })?;

        let ctx = LaunchContext::new(id, self.config.input_file_name.clone())
            .with_progress(self.progress.clone())
            .with_cancel(cancel);
        info!(
            job_id = %id,
            working_dir = %spec.working_dir.display(),
            "Launching job"
        );

        match backend.launch(&spec, &ctx).await? {
            LaunchOutcome::Submitted {
                backend_id,
                mut files,
            } => {
                files.input_file = Some(input_path);
                Ok(Job::new(id, spec, backend, backend_id, files))
            }
            LaunchOutcome::Finished { outcome, mut files } => {
                files.input_file = Some(input_path);
                let kind = spec.backend;
                let mut job = Job::new(id, spec, backend, "", files);
                job.exit_code = outcome.exit_code;
                if outcome.cancelled {
                    job.cancel_requested = true;
                    job.advance(JobStatus::Cancelled);
                } else if outcome.success() {
                    job.advance(JobStatus::Completed);
                } else {
                    let err = JobError::ExternalProcess {
                        backend: kind,
                        program: outcome.program.clone(),
                        exit_code: outcome.exit_code,
                        output_tail: outcome.output_tail(FAILURE_TAIL_LINES),
                    };
                    warn!(job_id = %id, "{}", err);
                    job.fail(Failure::from(&err));
                }
                job.log = outcome.stdout;
                job.stderr = outcome.stderr;
                self.finalize(&mut job).await;
                Ok(job)
            }
        }
    }

    async fn monitor(
        &self,
        job: &mut Job,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let monitor = JobMonitor::new(self.config.monitor.clone(), self.progress.clone());
        let Some(limit) = timeout else {
            return monitor.run(job, cancel).await;
        };
        match tokio::time::timeout(limit, monitor.run(job, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    job_id = %job.id(),
                    backend_id = %job.backend_id(),
                    status = %job.status(),
                    "Timed out waiting for job; it keeps running"
                );
                Err(JobError::Timeout {
                    job_id: job.display_id(),
                    waited: limit,
                    status: job.status(),
                })
            }
        }
    }

    /// Builds and caches the terminal result; fires the completion hook once.
    async fn finalize(&self, job: &mut Job) -> JobResult {
        if let Some(result) = &job.result {
            return result.clone();
        }

        let mut artifacts = Vec::new();
        if job.status() == JobStatus::Completed {
            let patterns = self.result_patterns(job.spec());
            match discover_artifacts(&job.spec().working_dir, &patterns) {
                Ok(found) => artifacts = found,
                Err(e) => {
                    warn!(job_id = %job.id(), "{}", e);
                    job.downgrade_to_failed(Failure::from(&e));
                }
            }
        }

        let result = job.snapshot(artifacts);
        info!(
            job_id = %job.id(),
            backend = %result.backend,
            backend_id = %result.backend_id,
            status = %result.status,
            artifacts = result.artifacts.len(),
            "Job finished"
        );
        job.result = Some(result.clone());
        job.backend.release().await;
        if let Some(hook) = &self.hook {
            hook.on_complete(&result);
        }
        result
    }

    fn backend_for(&self, spec: &JobSpec) -> Result<Arc<dyn Backend>, JobError> {
        match self.backends.get(&spec.backend) {
            Some(backend) => Ok(backend.clone()),
            None => create_backend(spec, &self.config),
        }
    }

    /// Patterns a successful job must produce. Command overrides produce
    /// arbitrary files and only check patterns they name explicitly.
    fn result_patterns(&self, spec: &JobSpec) -> Vec<String> {
        match (&spec.result_patterns, &spec.command) {
            (Some(patterns), _) => patterns.clone(),
            (None, Some(_)) => Vec::new(),
            (None, None) => self.config.artifacts.result_patterns.clone(),
        }
    }
}

fn is_protected(
    path: &Path,
    working_dir: &Path,
    patterns: &[ArtifactPattern],
    artifacts: &[PathBuf],
) -> bool {
    if artifacts.iter().any(|a| a == path) {
        return true;
    }
    let Ok(relative) = path.strip_prefix(working_dir) else {
        return false;
    };
    let relative = relative.to_string_lossy().replace('\\', "/");
    patterns.iter().any(|p| p.matches(&relative))
}
