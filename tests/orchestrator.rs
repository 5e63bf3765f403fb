//! Integration tests for the job orchestrator.
//!
//! Asynchronous jobs run against a scripted backend on a paused clock.
//! Local jobs run real `/bin/sh` commands in a temporary directory.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cdi_jobs::backend::{parse_state_token, parse_submission_output, LaunchContext, LaunchOutcome};
use cdi_jobs::config::MonitorConfig;
use cdi_jobs::job::{IntermediateFiles, PollRecord};
use cdi_jobs::progress::NullProgress;
use cdi_jobs::{
    Backend, BackendKind, CancelCause, CleanupPolicy, CompletionHook, EnvDefaults, ErrorKind, Job,
    JobError, JobOrchestrator, JobResult, JobSpec, JobStatus, JobTaskOutcome, OrchestratorConfig,
    SshTarget,
};

const SCHEDULER_ID: &str = "482913";

#[derive(Clone, Copy)]
enum Reply {
    Status(&'static str),
    Unreachable,
}

/// Batch backend whose `poll` answers come from a script.
///
/// Once the script runs out the last reply repeats. A cancel request makes
/// every later poll report `CANCELLED`.
struct ScriptedScheduler {
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    polls: AtomicUsize,
    cancels: AtomicUsize,
    cancelled: AtomicBool,
}

impl ScriptedScheduler {
    fn new(replies: &[Reply]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().copied().collect()),
            last: Mutex::new(Reply::Status("PENDING")),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::BatchRemote
    }

    async fn launch(&self, spec: &JobSpec, _ctx: &LaunchContext) -> Result<LaunchOutcome, JobError> {
        Ok(LaunchOutcome::Submitted {
            backend_id: SCHEDULER_ID.to_string(),
            files: IntermediateFiles::default()
                .with_script(spec.working_dir.join("pynx-id01cdi.slurm"))
                .with_log(spec.working_dir.join("pynx-id01cdi.slurm-482913.out")),
        })
    }

    async fn poll(&self, _job: &Job) -> Result<PollRecord, JobError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.cancelled.load(Ordering::SeqCst) {
            let (raw, status) = parse_state_token("CANCELLED by 1000");
            return Ok(PollRecord::new(raw, status));
        }
        let reply = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.replies.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        };
        match reply {
            Reply::Status(output) => {
                let (raw, status) = parse_state_token(output);
                Ok(PollRecord::new(raw, status))
            }
            Reply::Unreachable => Err(JobError::Connection {
                host: "slurm-nice-devel".to_string(),
                message: "ssh: connect to host slurm-nice-devel port 22: Connection refused"
                    .to_string(),
            }),
        }
    }

    async fn cancel(&self, _job: &Job) -> Result<(), JobError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
    last: Mutex<Option<JobResult>>,
}

impl CompletionHook for CountingHook {
    fn on_complete(&self, result: &JobResult) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(result.clone());
    }
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default().with_monitor(
        MonitorConfig::fixed(Duration::from_secs(10))
            .with_query_retries(2, Duration::from_secs(5)),
    );
    config.local.shell = "/bin/sh".to_string();
    config
}

fn batch_orchestrator(backend: Arc<ScriptedScheduler>) -> JobOrchestrator {
    JobOrchestrator::new(test_config())
        .with_env_defaults(EnvDefaults::new("dsimonne", "/home/dsimonne"))
        .with_progress(Arc::new(NullProgress))
        .with_backend(BackendKind::BatchRemote, backend)
}

fn batch_spec(dir: &Path) -> JobSpec {
    JobSpec::new(dir, BackendKind::BatchRemote)
        .with_ssh(SshTarget::new("slurm-nice-devel"))
        .with_parameter("data", "'S12_pynx_norm_run3.npz'")
        .with_parameter("nb_run", "20")
        .with_result_patterns(Vec::new())
}

fn local_orchestrator() -> JobOrchestrator {
    JobOrchestrator::new(test_config())
        .with_env_defaults(EnvDefaults::default())
        .with_progress(Arc::new(NullProgress))
}

fn local_spec(dir: &Path, command: &str) -> JobSpec {
    JobSpec::new(dir, BackendKind::Local)
        .with_command(command)
        .with_result_patterns(vec!["*Run*.cxi".to_string()])
}

// ============================================================================
// Asynchronous jobs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_running_then_completed() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING"), Reply::Status("COMPLETED")]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    assert_eq!(job.status(), JobStatus::Submitted);
    assert_eq!(job.backend_id(), SCHEDULER_ID);

    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.backend_id, SCHEDULER_ID);
    assert_eq!(result.backend, BackendKind::BatchRemote);
    assert!(result.failure.is_none());
    assert_eq!(backend.polls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_input_file_written_before_launch() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("COMPLETED")]);
    let orchestrator = batch_orchestrator(backend);

    let job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let input = job.files().input_file.clone().unwrap();
    assert_eq!(input, dir.path().join("pynx-cdi-inputs.txt"));
    let content = std::fs::read_to_string(input).unwrap();
    assert_eq!(content, "data = 'S12_pynx_norm_run3.npz'\nnb_run = 20\n");
}

#[tokio::test(start_paused = true)]
async fn test_await_completion_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("COMPLETED")]);
    let hook = Arc::new(CountingHook::default());
    let orchestrator = batch_orchestrator(backend.clone()).with_completion_hook(hook.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let first = orchestrator.await_completion(&mut job, None).await.unwrap();
    let polls = backend.polls();
    let second = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.polls(), polls);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(hook.last.lock().unwrap().as_ref(), Some(&first));
}

#[tokio::test(start_paused = true)]
async fn test_status_never_moves_backwards() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[
        Reply::Status("PENDING"),
        Reply::Status("RUNNING"),
        Reply::Status("PENDING"),
        Reply::Status("RUNNING"),
        Reply::Status("COMPLETED"),
    ]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(
        job.history(),
        &[
            JobStatus::Submitted,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );
    assert_eq!(backend.polls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_failure_states() {
    for token in ["FAILED", "TIMEOUT", "OUT_OF_MEMORY", "NODE_FAIL"] {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING"), Reply::Status(token)]);
        let orchestrator = batch_orchestrator(backend);

        let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
        let result = orchestrator.await_completion(&mut job, None).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed, "token {}", token);
        assert_eq!(result.last_raw_status.as_deref(), Some(token));
        assert!(result.artifacts.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_query_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[
        Reply::Status("RUNNING"),
        Reply::Unreachable,
        Reply::Unreachable,
        Reply::Status("COMPLETED"),
    ]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(backend.polls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_query_retries_fail_the_job() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING"), Reply::Unreachable]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.failure_kind(), Some(ErrorKind::Monitoring));
    assert_eq!(result.last_raw_status.as_deref(), Some("RUNNING"));
    assert!(!result.is_success());
    // one good poll, then the first failure and two retries
    assert_eq!(backend.polls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_leaves_job_running() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING")]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let err = orchestrator
        .await_completion(&mut job, Some(Duration::from_secs(60)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(job.status(), JobStatus::Running);
    assert!(job.result().is_none());
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 0);

    // the caller can still cancel and collect the result
    orchestrator.cancel(&mut job).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.cancel_cause, Some(CancelCause::User));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_on_terminal_job_is_rejected() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("COMPLETED")]);
    let orchestrator = batch_orchestrator(backend.clone());

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let before = orchestrator.await_completion(&mut job, None).await.unwrap();

    let err = orchestrator.cancel(&mut job).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(job.result(), Some(&before));
}

#[tokio::test(start_paused = true)]
async fn test_backend_side_cancellation() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING"), Reply::Status("CANCELLED+")]);
    let orchestrator = batch_orchestrator(backend);

    let mut job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.cancel_cause, Some(CancelCause::Backend));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_job_cancel() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING")]);
    let orchestrator = Arc::new(batch_orchestrator(backend.clone()));

    let task = orchestrator.spawn(batch_spec(dir.path()), None);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(!task.is_finished());
    task.cancel();

    let result = task.join().await.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.cancel_cause, Some(CancelCause::User));
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_job_timeout_keeps_handle() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING")]);
    let orchestrator = Arc::new(batch_orchestrator(backend.clone()));

    let task = orchestrator.spawn(batch_spec(dir.path()), Some(Duration::from_secs(60)));
    let mut job = match task.join_job().await.unwrap() {
        JobTaskOutcome::Unfinished { job, error } => {
            assert_eq!(error.kind(), ErrorKind::Timeout);
            job
        }
        JobTaskOutcome::Finished(job) => panic!("job ended {}", job.status()),
    };
    assert_eq!(job.status(), JobStatus::Running);
    assert_eq!(job.backend_id(), SCHEDULER_ID);
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 0);

    orchestrator.cancel(&mut job).await.unwrap();
    assert_eq!(backend.cancels.load(Ordering::SeqCst), 1);
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.cancel_cause, Some(CancelCause::User));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_job_timeout_join_reports_timeout() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("PENDING")]);
    let orchestrator = Arc::new(batch_orchestrator(backend));

    let task = orchestrator.spawn(batch_spec(dir.path()), Some(Duration::from_secs(30)));
    let err = task.join().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_completed_job_missing_artifacts_fails() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("COMPLETED")]);
    let orchestrator = batch_orchestrator(backend);

    let spec = batch_spec(dir.path()).with_result_patterns(vec!["*Run*.cxi".to_string()]);
    let mut job = orchestrator.submit(spec).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.failure_kind(), Some(ErrorKind::MissingArtifact));
    assert!(result.artifacts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_completed_job_lists_artifacts() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("S12_Run0001_LLKf000.cxi"), b"").unwrap();
    std::fs::write(dir.path().join("S12_Run0002_LLKf000.cxi"), b"").unwrap();
    std::fs::write(dir.path().join("S12_pynx_norm_run3.npz"), b"").unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("COMPLETED")]);
    let orchestrator = batch_orchestrator(backend);

    let spec = batch_spec(dir.path()).with_result_patterns(vec!["*Run*.cxi".to_string()]);
    let mut job = orchestrator.submit(spec).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(
        result.artifacts,
        vec![
            dir.path().join("S12_Run0001_LLKf000.cxi"),
            dir.path().join("S12_Run0002_LLKf000.cxi"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_requires_terminal_job() {
    let dir = TempDir::new().unwrap();
    let backend = ScriptedScheduler::new(&[Reply::Status("RUNNING")]);
    let orchestrator = batch_orchestrator(backend);

    let job = orchestrator.submit(batch_spec(dir.path())).await.unwrap();
    let err = orchestrator
        .cleanup(&job, &CleanupPolicy::remove_all())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(dir.path().join("pynx-cdi-inputs.txt").exists());
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_invalid_specs_are_rejected() {
    let orchestrator = local_orchestrator();

    let err = orchestrator
        .submit(JobSpec::new("", BackendKind::Local))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = orchestrator
        .submit(JobSpec::new("/tmp/job", BackendKind::BatchRemote))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = orchestrator
        .submit(JobSpec::new("/tmp/job", BackendKind::BatchLocal).with_command("echo hi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_submission_output_parsing() {
    assert_eq!(
        parse_submission_output("Submitted batch job 482913\n").as_deref(),
        Some(SCHEDULER_ID)
    );
    assert_eq!(
        parse_submission_output("sbatch: warning: partition gpu is busy\nSubmitted batch job 7")
            .as_deref(),
        Some("7")
    );
    assert_eq!(parse_submission_output(""), None);
    assert_eq!(
        parse_submission_output("sbatch: error: Batch job submission failed"),
        None
    );
    assert_eq!(parse_submission_output("Submitted batch job abc"), None);
}

// ============================================================================
// Local jobs
// ============================================================================

#[tokio::test]
async fn test_local_job_completes_with_artifacts() {
    let dir = TempDir::new().unwrap();
    let orchestrator = local_orchestrator();
    let spec = local_spec(
        dir.path(),
        "echo 'CDI Run: 1/1'; cat pynx-cdi-inputs.txt; touch S12_Run0001_LLKf000.cxi",
    )
    .with_parameter("nb_run", "1");

    let mut job = orchestrator.submit(spec).await.unwrap();
    assert!(job.is_terminal());
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.backend_id.is_empty());
    assert_eq!(
        result.artifacts,
        vec![dir.path().join("S12_Run0001_LLKf000.cxi")]
    );
    assert!(result.stdout_tail.contains("CDI Run: 1/1"));
    assert!(result.stdout_tail.contains("nb_run = 1"));
}

#[tokio::test]
async fn test_local_job_nonzero_exit() {
    let dir = TempDir::new().unwrap();
    let orchestrator = local_orchestrator();

    let mut job = orchestrator
        .submit(local_spec(dir.path(), "echo 'CUDA error' >&2; exit 3"))
        .await
        .unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.failure_kind(), Some(ErrorKind::ExternalProcess));
    assert!(result.stderr_tail.contains("CUDA error"));
}

#[tokio::test]
async fn test_local_job_without_results_fails() {
    let dir = TempDir::new().unwrap();
    let orchestrator = local_orchestrator();

    let mut job = orchestrator.submit(local_spec(dir.path(), "true")).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.failure_kind(), Some(ErrorKind::MissingArtifact));
}

#[tokio::test]
async fn test_clear_previous_results() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("S12_Run0009_LLKf000.cxi"), b"old").unwrap();
    std::fs::write(dir.path().join("S12_Run0009_LLKf000.png"), b"old").unwrap();
    let orchestrator = local_orchestrator();

    let spec = local_spec(dir.path(), "touch S12_Run0001_LLKf000.cxi")
        .with_clear_previous_results(true);
    let mut job = orchestrator.submit(spec).await.unwrap();
    let result = orchestrator.await_completion(&mut job, None).await.unwrap();

    assert_eq!(
        result.artifacts,
        vec![dir.path().join("S12_Run0001_LLKf000.cxi")]
    );
    assert!(!dir.path().join("S12_Run0009_LLKf000.png").exists());
}

#[tokio::test]
async fn test_cleanup_keeps_artifacts() {
    let dir = TempDir::new().unwrap();
    let orchestrator = local_orchestrator();

    let mut job = orchestrator
        .submit(local_spec(dir.path(), "touch S12_Run0001_LLKf000.cxi"))
        .await
        .unwrap();
    orchestrator.await_completion(&mut job, None).await.unwrap();

    let removed = orchestrator
        .cleanup(&job, &CleanupPolicy::remove_all())
        .unwrap();
    assert_eq!(removed, vec![dir.path().join("pynx-cdi-inputs.txt")]);
    assert!(dir.path().join("S12_Run0001_LLKf000.cxi").exists());

    // nothing left to remove
    let removed = orchestrator
        .cleanup(&job, &CleanupPolicy::remove_all())
        .unwrap();
    assert!(removed.is_empty());
}

#[tokio::test]
async fn test_local_job_cancelled_by_spawn_handle() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Arc::new(local_orchestrator());

    let task = orchestrator.spawn(local_spec(dir.path(), "sleep 30"), None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    task.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), task.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.cancel_cause, Some(CancelCause::User));
    assert!(result.artifacts.is_empty());
}
