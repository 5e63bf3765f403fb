//! Job data model: specifications, status state machine and results.

mod record;
mod spec;
mod status;

pub use record::{
    Failure, IntermediateFiles, Job, JobResult, LogTail, PollRecord, DEFAULT_TAIL_LINES,
};
pub use spec::{BackendKind, HostKeyPolicy, JobSpec, Parameters, ResourceRequest, SshTarget};
pub use status::{CancelCause, JobStatus};
