//! Job specifications.
//!
//! A [`JobSpec`] is the immutable description of one phase-retrieval job:
//! where it runs, which parameters go into its input file and how the
//! backend reaches the compute resource.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::EnvDefaults;
use crate::error::JobError;

/// Execution backend selected for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Child process on the same host.
    Local,
    /// Batch scheduler reached through the local shell.
    BatchLocal,
    /// Batch scheduler reached over SSH.
    BatchRemote,
    /// Program run directly over SSH for the whole job duration.
    RemoteShell,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::BatchLocal => "batch-local",
            BackendKind::BatchRemote => "batch-remote",
            BackendKind::RemoteShell => "remote-shell",
        }
    }

    /// Whether `launch` returns before the work is done and the job must be polled.
    pub fn is_async(&self) -> bool {
        matches!(self, BackendKind::BatchLocal | BackendKind::BatchRemote)
    }

    /// Whether the backend needs an SSH target.
    pub fn requires_ssh(&self) -> bool {
        matches!(self, BackendKind::BatchRemote | BackendKind::RemoteShell)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "local" => Ok(BackendKind::Local),
            "batch-local" => Ok(BackendKind::BatchLocal),
            "batch-remote" => Ok(BackendKind::BatchRemote),
            "remote-shell" => Ok(BackendKind::RemoteShell),
            other => Err(JobError::validation(format!(
                "unknown backend kind '{}'",
                other
            ))),
        }
    }
}

/// How the SSH client treats unknown or changed host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Trust on first use: unknown hosts are added, changed keys are refused.
    #[default]
    AcceptNew,
    /// Only hosts already present in `known_hosts` are accepted.
    Strict,
}

impl HostKeyPolicy {
    /// Value for the client's `StrictHostKeyChecking` option.
    pub fn ssh_option(&self) -> &'static str {
        match self {
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Strict => "yes",
        }
    }
}

/// Remote host reached over SSH with key-based authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Overrides the configured host key policy for this target.
    #[serde(default)]
    pub host_key_policy: Option<HostKeyPolicy>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            key_file: None,
            port: None,
            host_key_policy: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = Some(policy);
        self
    }

    /// Fills the user and key file from `env` where they are not set.
    pub fn resolve(mut self, env: &EnvDefaults) -> Self {
        if self.user.is_none() {
            self.user = env.user.clone();
        }
        if self.key_file.is_none() {
            self.key_file = env.key_file();
        }
        self
    }

    /// `user@host`, or just the host when no user is known.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Compute resources requested from the batch scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// Submission script template: a file path, or `default` for the built-in one.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
}

fn default_nodes() -> u32 {
    1
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            template: None,
            partition: None,
            job_name: None,
        }
    }
}

impl ResourceRequest {
    pub fn new(nodes: u32) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }
}

/// Ordered `name = value` parameters written into the job's input file.
///
/// Deserializes from a mapping whose scalar values are rendered the way the
/// phasing program's parameter parser expects them (`True`, `None`, `[1, 2]`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Sets a parameter, replacing an earlier value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the input file content, one `name = value` line per entry.
    pub fn to_input_file(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{} = {}\n", name, value))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParametersVisitor;

        impl<'de> Visitor<'de> for ParametersVisitor {
            type Value = Parameters;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of parameter names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Parameters, A::Error> {
                let mut params = Parameters::new();
                while let Some((name, value)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    params.insert(name, render_value(&value));
                }
                Ok(params)
            }
        }

        deserializer.deserialize_map(ParametersVisitor)
    }
}

fn render_value(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => format!("'{}'", s),
                    other => render_value(other),
                })
                .collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(_) => value.to_string(),
    }
}

/// Immutable description of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Directory holding the job's input and output files.
    pub working_dir: PathBuf,
    #[serde(default)]
    pub parameters: Parameters,
    pub backend: BackendKind,
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
    #[serde(default)]
    pub ssh: Option<SshTarget>,
    /// Shell command run instead of the phasing program (local and remote-shell only).
    #[serde(default)]
    pub command: Option<String>,
    /// Remove files left by a former run before launching.
    #[serde(default)]
    pub clear_previous_results: bool,
    /// Result patterns overriding the configured ones.
    #[serde(default)]
    pub result_patterns: Option<Vec<String>>,
}

impl JobSpec {
    pub fn new(working_dir: impl Into<PathBuf>, backend: BackendKind) -> Self {
        Self {
            working_dir: working_dir.into(),
            parameters: Parameters::new(),
            backend,
            resources: None,
            ssh: None,
            command: None,
            clear_previous_results: false,
            result_patterns: None,
        }
    }

    /// Loads a job spec from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JobError::validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| JobError::validation(format!("{}: {}", path.display(), e)))
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_ssh(mut self, target: SshTarget) -> Self {
        self.ssh = Some(target);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_clear_previous_results(mut self, clear: bool) -> Self {
        self.clear_previous_results = clear;
        self
    }

    pub fn with_result_patterns(mut self, patterns: Vec<String>) -> Self {
        self.result_patterns = Some(patterns);
        self
    }

    /// Resolves environment-derived SSH defaults once.
    pub fn with_env_defaults(mut self, env: &EnvDefaults) -> Self {
        self.ssh = self.ssh.take().map(|target| target.resolve(env));
        self
    }

    /// Node count, defaulting to one.
    pub fn nodes(&self) -> u32 {
        self.resources.as_ref().map(|r| r.nodes).unwrap_or(1)
    }

    /// Checks the spec's own invariants and prepares the working directory.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(JobError::validation("working directory is empty"));
        }
        if self.backend.requires_ssh() {
            match &self.ssh {
                None => {
                    return Err(JobError::validation(format!(
                        "backend '{}' requires an ssh target",
                        self.backend
                    )))
                }
                Some(target) if target.host.trim().is_empty() => {
                    return Err(JobError::validation("ssh target host is empty"))
                }
                Some(_) => {}
            }
        }
        if self.backend.is_async() && self.command.is_some() {
            return Err(JobError::validation(format!(
                "command overrides are not supported by backend '{}'",
                self.backend
            )));
        }
        if let Some(resources) = &self.resources {
            if resources.nodes == 0 {
                return Err(JobError::validation("node count must be at least 1"));
            }
        }
        if let Some(command) = &self.command {
            if command.trim().is_empty() {
                return Err(JobError::validation("command override is empty"));
            }
        }
        if let Some(patterns) = &self.result_patterns {
            if patterns.iter().any(|p| p.trim().is_empty()) {
                return Err(JobError::validation("empty result pattern"));
            }
        }
        Ok(())
    }

    /// Ensures the working directory exists.
    pub fn prepare_working_dir(&self) -> Result<(), JobError> {
        if self.working_dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.working_dir).map_err(|e| {
            JobError::validation(format!(
                "cannot create working directory {}: {}",
                self.working_dir.display(),
                e
            ))
        })
    }
}
