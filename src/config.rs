//! Orchestrator configuration.
//!
//! All timing, command names and file naming conventions used by the
//! backends live here so that none of them are hardcoded at call sites.
//! The whole tree can be loaded from a YAML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::HostKeyPolicy;

/// Top-level configuration for [`JobOrchestrator`](crate::orchestrator::JobOrchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Name of the parameter file written into the working directory.
    pub input_file_name: String,
    /// Same-host subprocess settings.
    pub local: LocalConfig,
    /// Direct SSH execution settings.
    pub remote: RemoteConfig,
    /// Batch scheduler settings.
    pub batch: BatchConfig,
    /// Polling behaviour for asynchronous jobs.
    pub monitor: MonitorConfig,
    /// SSH transport settings.
    pub ssh: SshConfig,
    /// Result discovery and clearing patterns.
    pub artifacts: ArtifactConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            input_file_name: "pynx-cdi-inputs.txt".to_string(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            batch: BatchConfig::default(),
            monitor: MonitorConfig::default(),
            ssh: SshConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads a configuration from a YAML file; missing keys take defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses a configuration from YAML text and validates it.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_file_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "input_file_name",
                message: "must not be empty".to_string(),
            });
        }
        if self.batch.submit_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "batch.submit_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        self.monitor.validate()
    }

    /// Sets the monitor configuration.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the local program.
    pub fn with_local_program(mut self, program: impl Into<String>) -> Self {
        self.local.program = program.into();
        self
    }

    /// Sets the batch configuration.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the default result patterns.
    pub fn with_result_patterns(mut self, patterns: Vec<String>) -> Self {
        self.artifacts.result_patterns = patterns;
        self
    }
}

/// Settings for the same-host subprocess backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Phase retrieval program, invoked with the input file as its argument.
    pub program: String,
    /// Shell used for command-line overrides.
    pub shell: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            program: "pynx-cdi-id01".to_string(),
            shell: "/bin/bash".to_string(),
        }
    }
}

/// Settings for the direct SSH backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Program run on the remote host.
    pub program: String,
    /// Environment activation run before the program.
    pub setup_command: Option<String>,
    /// Log file written with `tee`; `{host}` is replaced by the host name.
    pub log_file_template: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            program: "pynx-id01cdi.py".to_string(),
            setup_command: Some("source /sware/exp/pynx/activate_pynx.sh 2022.1".to_string()),
            log_file_template: "phase_retrieval_{host}.log".to_string(),
        }
    }
}

impl RemoteConfig {
    /// Log file name for a given host.
    pub fn log_file_name(&self, host: &str) -> String {
        self.log_file_template.replace("{host}", host)
    }
}

/// Settings for the batch scheduler backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// File name of the rendered submission script.
    pub script_name: String,
    /// Submission command.
    pub submit_command: String,
    /// Accounting command used for status queries.
    pub status_command: String,
    /// Cancellation command.
    pub cancel_command: String,
    /// Job log file; `{job_id}` is replaced by the scheduler job id.
    pub log_file_template: String,
    /// Marker identifying progress lines in the job log.
    pub progress_marker: String,
    /// Number of submission attempts before giving up.
    pub submit_attempts: u32,
    /// Delay between submission attempts in milliseconds.
    pub submit_retry_delay_ms: u64,
    /// Template used when the job spec does not name one.
    pub template: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            script_name: "pynx-id01cdi.slurm".to_string(),
            submit_command: "sbatch".to_string(),
            status_command: "sacct".to_string(),
            cancel_command: "scancel".to_string(),
            log_file_template: "pynx-id01cdi.slurm-{job_id}.out".to_string(),
            progress_marker: "CDI Run:".to_string(),
            submit_attempts: 3,
            submit_retry_delay_ms: 3000,
            template: None,
        }
    }
}

impl BatchConfig {
    /// Log file name for a given scheduler job id.
    pub fn log_file_name(&self, job_id: &str) -> String {
        self.log_file_template.replace("{job_id}", job_id)
    }

    /// Delay between submission attempts.
    pub fn submit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.submit_retry_delay_ms)
    }

    /// Sets the submission attempts and delay.
    pub fn with_submit_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.submit_attempts = attempts;
        self.submit_retry_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Polling behaviour for asynchronous jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Initial delay between status queries in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound for the delay once backoff applies.
    pub max_poll_interval_ms: u64,
    /// Growth factor applied while the status does not change. `1.0` keeps it fixed.
    pub backoff_factor: f64,
    /// Consecutive failed status queries tolerated before escalating.
    pub query_retries: u32,
    /// Delay before retrying a failed status query, in milliseconds.
    pub query_retry_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_poll_interval_ms: 60_000,
            backoff_factor: 1.0,
            query_retries: 3,
            query_retry_delay_ms: 2_000,
        }
    }
}

impl MonitorConfig {
    /// Creates a fixed-interval configuration.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            poll_interval_ms: interval.as_millis() as u64,
            max_poll_interval_ms: interval.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Sets exponential backoff up to `max`.
    pub fn with_backoff(mut self, factor: f64, max: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_poll_interval_ms = max.as_millis() as u64;
        self
    }

    /// Sets the status-query retry budget.
    pub fn with_query_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.query_retries = retries;
        self.query_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms))
    }

    pub fn query_retry_delay(&self) -> Duration {
        Duration::from_millis(self.query_retry_delay_ms)
    }

    /// Next poll delay after `current`, applying the backoff factor.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let max = self.max_poll_interval();
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .map_or(max, |grown| grown.min(max))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.poll_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "monitor.backoff_factor",
                message: format!("must be a finite number >= 1.0, got {}", self.backoff_factor),
            });
        }
        if self.query_retries < 2 {
            return Err(ConfigError::Invalid {
                field: "monitor.query_retries",
                message: format!("must be at least 2, got {}", self.query_retries),
            });
        }
        Ok(())
    }
}

/// SSH transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// SSH client binary.
    pub ssh_program: String,
    /// Default host key policy when the target does not override it.
    pub host_key_policy: HostKeyPolicy,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            host_key_policy: HostKeyPolicy::AcceptNew,
            connect_timeout_secs: 15,
        }
    }
}

/// Result discovery and clearing patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Patterns that must each match at least one file after success.
    pub result_patterns: Vec<String>,
    /// Patterns removed before launch when a spec asks to clear former results.
    pub clear_patterns: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            result_patterns: vec!["*Run*.cxi".to_string()],
            clear_patterns: vec!["*Run*.cxi".to_string(), "*Run*.png".to_string()],
        }
    }
}

/// Process-environment defaults, resolved once.
///
/// Fallback rules: the user comes from `USER`, then `LOGNAME`; the home
/// directory from `HOME`; the key file is `<home>/.ssh/id_rsa`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDefaults {
    pub user: Option<String>,
    pub home: Option<PathBuf>,
}

impl EnvDefaults {
    /// Reads the defaults from the current process environment.
    pub fn from_env() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .ok()
            .filter(|u| !u.is_empty());
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self { user, home }
    }

    /// Creates explicit defaults.
    pub fn new(user: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            user: Some(user.into()),
            home: Some(home.into()),
        }
    }

    /// Default private key path.
    pub fn key_file(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join(".ssh").join("id_rsa"))
    }
}
