//! Submission script rendering.

use std::path::Path;

use tera::{Context, Tera};

use crate::config::BatchConfig;
use crate::error::JobError;
use crate::job::JobSpec;

/// Built-in SLURM submission template.
pub const DEFAULT_TEMPLATE: &str = include_str!("../../templates/slurm_default.slurm");

/// Identifier selecting the built-in template.
pub const DEFAULT_TEMPLATE_ID: &str = "default";

/// Values substituted into a submission template.
///
/// `log_file` is the configured log template with the scheduler's `%j`
/// standing in for the job id, so the file the scheduler writes is the one
/// the backend tails and cleans up whatever the job is named.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub working_dir: &'a Path,
    pub nodes: u32,
    pub partition: Option<&'a str>,
    pub job_name: &'a str,
    pub input_file: &'a str,
    pub log_file: String,
}

impl<'a> ScriptContext<'a> {
    pub fn from_spec(spec: &'a JobSpec, batch: &'a BatchConfig, input_file: &'a str) -> Self {
        let resources = spec.resources.as_ref();
        Self {
            working_dir: &spec.working_dir,
            nodes: spec.nodes(),
            partition: resources.and_then(|r| r.partition.as_deref()),
            job_name: resources
                .and_then(|r| r.job_name.as_deref())
                .unwrap_or(&batch.script_name),
            input_file,
            log_file: batch.log_file_name("%j"),
        }
    }

    fn to_tera(&self) -> Context {
        let dir = self.working_dir.display().to_string();
        let mut context = Context::new();
        context.insert("data_path", &dir);
        context.insert("working_dir", &dir);
        context.insert("number_of_nodes", &self.nodes);
        context.insert("job_name", self.job_name);
        context.insert("input_file", self.input_file);
        context.insert("log_file", &self.log_file);
        if let Some(partition) = self.partition {
            context.insert("partition", partition);
        }
        // scheduler-side variables stay shell variables in the script
        context.insert("SLURM_JOBID", "$SLURM_JOBID");
        context.insert("SLURM_NTASKS", "$SLURM_NTASKS");
        context
    }
}

/// Loads a template by identifier: a file path, or `default`.
pub fn load_template(template: Option<&str>) -> Result<String, JobError> {
    match template {
        None | Some(DEFAULT_TEMPLATE_ID) => Ok(DEFAULT_TEMPLATE.to_string()),
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            JobError::validation(format!("cannot read submission template {}: {}", path, e))
        }),
    }
}

/// Renders a submission script.
pub fn render_script(template: &str, ctx: &ScriptContext<'_>) -> Result<String, JobError> {
    Tera::one_off(template, &ctx.to_tera(), false)
        .map_err(|e| JobError::validation(format!("submission template error: {:?}", e)))
}
