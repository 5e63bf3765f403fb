//! Polling state machine for asynchronous jobs.
//!
//! The monitor queries the backend, sleeps between queries (a cooperative
//! yield on the tokio timer, so tests drive it with a paused clock) and stops
//! once the job reaches a terminal state. Failed queries are retried up to
//! the configured budget; exhausting it ends the job as `failed` with a
//! monitoring failure rather than an error, so a job whose status could not
//! be observed is never reported as successful.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::CancellationToken;
use crate::config::MonitorConfig;
use crate::error::JobError;
use crate::job::{Failure, Job};
use crate::progress::{ProgressSink, ProgressUpdate};

/// Drives `poll` for one job until it is terminal.
pub struct JobMonitor {
    config: MonitorConfig,
    progress: Arc<dyn ProgressSink>,
}

impl JobMonitor {
    pub fn new(config: MonitorConfig, progress: Arc<dyn ProgressSink>) -> Self {
        Self { config, progress }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Polls until the job is terminal.
    ///
    /// Tripping `cancel` issues the backend's cancel command, retried on
    /// later iterations while it fails; polling continues until the backend
    /// confirms a terminal state. Errors are returned only for failures that
    /// retrying cannot fix, including a cancel command that keeps failing.
    pub async fn run(&self, job: &mut Job, cancel: &CancellationToken) -> Result<(), JobError> {
        let backend = job.backend.clone();
        let mut interval = self.config.poll_interval();
        let mut failures: u32 = 0;
        let mut cancel_failures: u32 = 0;

        while !job.is_terminal() {
            if cancel.is_cancelled() && !job.cancel_requested {
                if let Err(e) = self.request_cancel(job).await {
                    cancel_failures += 1;
                    if !e.is_retryable() || cancel_failures > self.config.query_retries {
                        error!(
                            job_id = %job.id(),
                            backend_id = %job.backend_id(),
                            attempts = cancel_failures,
                            "Giving up on cancellation: {}",
                            e
                        );
                        return Err(e);
                    }
                    warn!(
                        job_id = %job.id(),
                        attempt = cancel_failures,
                        max_retries = self.config.query_retries,
                        "Cancel command failed, retrying: {}",
                        e
                    );
                }
            }

            let delay = match backend.poll(job).await {
                Ok(record) => {
                    failures = 0;
                    for line in &record.fragment {
                        self.progress.on_progress(ProgressUpdate {
                            job_id: job.id(),
                            backend: job.backend_kind(),
                            backend_id: job.backend_id().to_string(),
                            line: line.clone(),
                        });
                    }
                    if record.status.is_none() {
                        debug!(
                            backend_id = %job.backend_id(),
                            raw_status = %record.raw_status,
                            "Unrecognised status token, polling again"
                        );
                    }
                    if job.apply_poll(&record) {
                        info!(
                            job_id = %job.id(),
                            backend_id = %job.backend_id(),
                            status = %job.status(),
                            "Job status changed"
                        );
                        interval = self.config.poll_interval();
                    } else {
                        interval = self.config.next_interval(interval);
                    }
                    interval
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures > self.config.query_retries {
                        let err = JobError::Monitoring {
                            backend: job.backend_kind(),
                            job_id: job.display_id(),
                            attempts: failures,
                            last_status: job.last_raw_status().map(str::to_string),
                            message: e.to_string(),
                        };
                        error!(job_id = %job.id(), "{}", err);
                        job.fail(Failure::from(&err));
                        break;
                    }
                    warn!(
                        job_id = %job.id(),
                        backend_id = %job.backend_id(),
                        attempt = failures,
                        max_retries = self.config.query_retries,
                        "Status query failed, retrying: {}",
                        e
                    );
                    self.config.query_retry_delay()
                }
                Err(e) => return Err(e),
            };

            if job.is_terminal() {
                break;
            }
            self.pause(delay, cancel).await;
        }
        Ok(())
    }

    /// Sleeps for `delay`, waking early on a fresh cancellation request.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            tokio::time::sleep(delay).await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    /// Issues the backend's cancel command. The job counts as cancelled by
    /// the user only once the command succeeded.
    async fn request_cancel(&self, job: &mut Job) -> Result<(), JobError> {
        info!(job_id = %job.id(), backend_id = %job.backend_id(), "Requesting cancellation");
        let backend = job.backend.clone();
        backend.cancel(job).await?;
        job.cancel_requested = true;
        Ok(())
    }
}
