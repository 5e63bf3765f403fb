//! cdi-jobs: job orchestration for CDI phase-retrieval runs.
//!
//! A job is described by a [`JobSpec`] and executed on one of three
//! backends: a local subprocess, a SLURM batch scheduler (on the local
//! machine or over SSH) or a remote shell over SSH. [`JobOrchestrator`]
//! submits jobs, monitors asynchronous ones to a terminal state and returns
//! a [`JobResult`] listing the produced artifacts.

// Core modules
pub mod artifacts;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod progress;

pub use backend::{Backend, CancellationToken};
pub use config::{EnvDefaults, OrchestratorConfig};
pub use error::{ConfigError, ErrorKind, JobError};
pub use job::{
    BackendKind, CancelCause, Job, JobResult, JobSpec, JobStatus, Parameters, ResourceRequest,
    SshTarget,
};
pub use orchestrator::{CleanupPolicy, CompletionHook, JobOrchestrator, JobTask, JobTaskOutcome};
pub use progress::{ProgressSink, ProgressUpdate};
