//! Error types for job orchestration.
//!
//! Every public operation either returns a value or fails with a [`JobError`].
//! Each variant maps onto one [`ErrorKind`], which is what terminal
//! [`JobResult`](crate::job::JobResult) values record when a job ends in
//! `failed` for a reason other than the external program's own verdict.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{BackendKind, JobStatus};

/// Taxonomy of failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed job spec or configuration.
    Validation,
    /// SSH, authentication or network failure.
    Connection,
    /// The scheduler accepted the command but no job identifier could be parsed.
    Submission,
    /// Status queries kept failing past the retry budget.
    Monitoring,
    /// Operation attempted on a job in an incompatible state.
    InvalidState,
    /// Success reported but expected output files are absent.
    MissingArtifact,
    /// Child process or remote command exited non-zero.
    ExternalProcess,
    /// `await_completion` gave up waiting; the job keeps running.
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Connection => "connection",
            ErrorKind::Submission => "submission",
            ErrorKind::Monitoring => "monitoring",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::MissingArtifact => "missing_artifact",
            ErrorKind::ExternalProcess => "external_process",
            ErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised by job orchestration operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job spec: {0}")]
    Validation(String),

    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Submission to {backend} failed: {message} (output: {output:?})")]
    Submission {
        backend: BackendKind,
        message: String,
        output: String,
    },

    #[error(
        "Monitoring of {backend} job {job_id} failed after {attempts} attempts: {message} (last status: {last_status:?})"
    )]
    Monitoring {
        backend: BackendKind,
        job_id: String,
        attempts: u32,
        last_status: Option<String>,
        message: String,
    },

    #[error("Cannot {operation} job {job_id} in state {status}")]
    InvalidState {
        operation: &'static str,
        job_id: String,
        status: JobStatus,
    },

    #[error("No files matching '{pattern}' in {}", dir.display())]
    MissingArtifact { pattern: String, dir: PathBuf },

    #[error("{program} on {backend} exited with code {exit_code:?}: {output_tail}")]
    ExternalProcess {
        backend: BackendKind,
        program: String,
        exit_code: Option<i32>,
        output_tail: String,
    },

    #[error("Timed out after {waited:?} waiting for job {job_id} (last status: {status})")]
    Timeout {
        job_id: String,
        waited: Duration,
        status: JobStatus,
    },
}

impl JobError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Validation(_) => ErrorKind::Validation,
            JobError::Connection { .. } => ErrorKind::Connection,
            JobError::Submission { .. } => ErrorKind::Submission,
            JobError::Monitoring { .. } => ErrorKind::Monitoring,
            JobError::InvalidState { .. } => ErrorKind::InvalidState,
            JobError::MissingArtifact { .. } => ErrorKind::MissingArtifact,
            JobError::ExternalProcess { .. } => ErrorKind::ExternalProcess,
            JobError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether a status query that failed with this error may be retried.
    ///
    /// Caller misuse (`Validation`, `InvalidState`) is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Connection { .. } | JobError::ExternalProcess { .. }
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        JobError::Validation(message.into())
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = JobError::validation("unknown backend");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());

        let err = JobError::Connection {
            host: "slurm-nice-devel".into(),
            message: "Permission denied (publickey)".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());

        let err = JobError::InvalidState {
            operation: "cancel",
            job_id: "482913".into(),
            status: JobStatus::Completed,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = JobError::Monitoring {
            backend: BackendKind::BatchRemote,
            job_id: "482913".into(),
            attempts: 3,
            last_status: Some("RUNNING".into()),
            message: "ssh exited with 255".into(),
        };
        let text = err.to_string();
        assert!(text.contains("batch-remote"));
        assert!(text.contains("482913"));
        assert!(text.contains("RUNNING"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::MissingArtifact.to_string(), "missing_artifact");
        assert_eq!(ErrorKind::Submission.to_string(), "submission");
    }
}
