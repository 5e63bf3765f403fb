//! Launched jobs, poll records and terminal results.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BackendKind, CancelCause, JobSpec, JobStatus};
use crate::backend::Backend;
use crate::error::{ErrorKind, JobError};

/// Default number of lines kept in a log tail.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// Bounded tail of output lines; older lines are dropped first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.push(line);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Joins the retained lines with newlines.
    pub fn to_text(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Outcome of one status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRecord {
    /// Status token exactly as the backend printed it.
    pub raw_status: String,
    /// Canonical status, `None` for unrecognised tokens.
    pub status: Option<JobStatus>,
    pub polled_at: DateTime<Utc>,
    /// Progress lines not reported by an earlier poll.
    pub fragment: Vec<String>,
}

impl PollRecord {
    pub fn new(raw_status: impl Into<String>, status: Option<JobStatus>) -> Self {
        Self {
            raw_status: raw_status.into(),
            status,
            polled_at: Utc::now(),
            fragment: Vec::new(),
        }
    }

    pub fn with_fragment(mut self, fragment: Vec<String>) -> Self {
        self.fragment = fragment;
        self
    }
}

/// Reason a job ended in `failed` other than a bare status token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&JobError> for Failure {
    fn from(err: &JobError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

/// Intermediate files a job wrote into its working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediateFiles {
    pub input_file: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub logs: Vec<PathBuf>,
}

impl IntermediateFiles {
    pub fn with_script(mut self, path: PathBuf) -> Self {
        self.script = Some(path);
        self
    }

    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.logs.push(path);
        self
    }
}

/// Terminal snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub backend: BackendKind,
    /// Backend-assigned identifier, empty for synchronous backends.
    pub backend_id: String,
    pub status: JobStatus,
    /// Set when `status` is `cancelled`.
    pub cancel_cause: Option<CancelCause>,
    /// Result files discovered after success.
    pub artifacts: Vec<PathBuf>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub failure: Option<Failure>,
    pub last_raw_status: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Wall-clock duration between launch and the terminal state.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A launched unit of work.
///
/// Owned by the caller; the orchestrator and monitor mutate it through
/// `&mut` borrows only.
pub struct Job {
    pub(crate) id: Uuid,
    pub(crate) spec: JobSpec,
    pub(crate) backend_id: String,
    pub(crate) status: JobStatus,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) last_polled_at: Option<DateTime<Utc>>,
    pub(crate) log: LogTail,
    pub(crate) stderr: LogTail,
    pub(crate) progress_seen: usize,
    pub(crate) last_raw_status: Option<String>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) cancel_requested: bool,
    pub(crate) failure: Option<Failure>,
    pub(crate) history: Vec<JobStatus>,
    pub(crate) files: IntermediateFiles,
    pub(crate) result: Option<JobResult>,
    pub(crate) backend: Arc<dyn Backend>,
}

impl Job {
    pub(crate) fn new(
        id: Uuid,
        spec: JobSpec,
        backend: Arc<dyn Backend>,
        backend_id: impl Into<String>,
        files: IntermediateFiles,
    ) -> Self {
        Self {
            id,
            spec,
            backend_id: backend_id.into(),
            status: JobStatus::Submitted,
            started_at: Utc::now(),
            last_polled_at: None,
            log: LogTail::default(),
            stderr: LogTail::default(),
            progress_seen: 0,
            last_raw_status: None,
            exit_code: None,
            cancel_requested: false,
            failure: None,
            history: vec![JobStatus::Submitted],
            files,
            result: None,
            backend,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.spec.backend
    }

    /// Backend-assigned identifier (scheduler job id), empty for synchronous backends.
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        self.last_polled_at
    }

    pub fn log_tail(&self) -> &LogTail {
        &self.log
    }

    /// Number of progress lines already reported.
    pub fn progress_seen(&self) -> usize {
        self.progress_seen
    }

    pub fn last_raw_status(&self) -> Option<&str> {
        self.last_raw_status.as_deref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Every status the job has been in, in order.
    pub fn history(&self) -> &[JobStatus] {
        &self.history
    }

    pub fn files(&self) -> &IntermediateFiles {
        &self.files
    }

    /// The cached terminal result, once computed.
    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    /// Human-readable identifier used in logs and errors.
    pub fn display_id(&self) -> String {
        if self.backend_id.is_empty() {
            self.id.to_string()
        } else {
            self.backend_id.clone()
        }
    }

    /// Moves the job forward; regressions and moves out of a terminal state are ignored.
    pub(crate) fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.history.push(next);
        true
    }

    /// Applies a poll outcome and reports whether the status changed.
    pub(crate) fn apply_poll(&mut self, record: &PollRecord) -> bool {
        self.last_polled_at = Some(record.polled_at);
        self.last_raw_status = Some(record.raw_status.clone());
        self.progress_seen += record.fragment.len();
        self.log.extend(record.fragment.iter().cloned());
        match record.status {
            Some(status) => self.advance(status),
            None => false,
        }
    }

    pub(crate) fn fail(&mut self, failure: Failure) {
        if self.advance(JobStatus::Failed) {
            self.failure = Some(failure);
        }
    }

    /// Turns a `completed` job into `failed` when its success could not be verified.
    pub(crate) fn downgrade_to_failed(&mut self, failure: Failure) {
        if self.status != JobStatus::Completed {
            return;
        }
        self.status = JobStatus::Failed;
        self.history.push(JobStatus::Failed);
        self.failure = Some(failure);
    }

    pub(crate) fn cancel_cause(&self) -> Option<CancelCause> {
        if self.status != JobStatus::Cancelled {
            return None;
        }
        if self.cancel_requested {
            Some(CancelCause::User)
        } else {
            Some(CancelCause::Backend)
        }
    }

    /// Builds the terminal snapshot.
    pub(crate) fn snapshot(&self, artifacts: Vec<PathBuf>) -> JobResult {
        JobResult {
            job_id: self.id,
            backend: self.spec.backend,
            backend_id: self.backend_id.clone(),
            status: self.status,
            cancel_cause: self.cancel_cause(),
            artifacts,
            stdout_tail: self.log.to_text(),
            stderr_tail: self.stderr.to_text(),
            exit_code: self.exit_code,
            failure: self.failure.clone(),
            last_raw_status: self.last_raw_status.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("backend", &self.spec.backend)
            .field("backend_id", &self.backend_id)
            .field("status", &self.status)
            .field("working_dir", &self.spec.working_dir)
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}
