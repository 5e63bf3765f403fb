//! Progress observers.
//!
//! Backends report each progress-marker line they see as a
//! [`ProgressUpdate`]. Sinks must not block: they are called from the task
//! that drains the job's output or polls its status.

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::job::BackendKind;

/// One progress line emitted by a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub backend: BackendKind,
    /// Scheduler job id, empty for synchronous backends.
    pub backend_id: String,
    pub line: String,
}

/// Receives progress updates for running jobs.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

/// Logs every update at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, update: ProgressUpdate) {
        info!(
            job_id = %update.job_id,
            backend = %update.backend,
            backend_id = %update.backend_id,
            "{}",
            update.line
        );
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// Forwards updates to a bounded channel, dropping them when the receiver lags.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgress {
    /// Creates a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, update: ProgressUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            debug!("Dropping progress update: {}", e);
        }
    }
}
