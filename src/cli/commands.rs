//! CLI command definitions for cdi-jobs.
//!
//! A thin front-end over [`JobOrchestrator`]: load a configuration and a job
//! spec from YAML, run the job, write its result next to the job files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::backend::script::{load_template, render_script, ScriptContext};
use crate::config::OrchestratorConfig;
use crate::job::{JobResult, JobSpec};
use crate::orchestrator::{CleanupPolicy, JobOrchestrator, JobTaskOutcome};

/// File the `run` command writes the job result to, inside the working directory.
pub const RESULT_FILE_NAME: &str = "job_result.json";

/// Phase-retrieval job runner for CDI pipelines.
#[derive(Parser)]
#[command(name = "cdi-jobs")]
#[command(about = "Run phase-retrieval jobs locally, on SLURM or over SSH")]
#[command(version)]
#[command(
    long_about = "cdi-jobs submits a phase-retrieval job to a local process, a SLURM scheduler (locally or over SSH) or a remote host over SSH, tracks it to completion and records the result.\n\nExample usage:\n  cdi-jobs run --config orchestrator.yaml --job job.yaml --timeout-secs 7200"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a job and wait for its result.
    Run(RunArgs),

    /// Print the submission script a batch job would use, without submitting.
    RenderScript(RenderScriptArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Orchestrator configuration (YAML). Defaults apply when omitted.
    #[arg(short, long, env = "CDI_JOBS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Job specification (YAML).
    #[arg(short, long)]
    pub job: PathBuf,

    /// Give up waiting after this many seconds; the job keeps running.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Remove the input file, submission script and logs after the job ends.
    #[arg(long)]
    pub cleanup: bool,

    /// Do not write the result file.
    #[arg(long)]
    pub no_result_file: bool,
}

#[derive(Parser, Debug)]
pub struct RenderScriptArgs {
    /// Orchestrator configuration (YAML). Defaults apply when omitted.
    #[arg(short, long, env = "CDI_JOBS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Job specification (YAML).
    #[arg(short, long)]
    pub job: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_job_command(args).await,
        Commands::RenderScript(args) => render_script_command(args),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let spec = JobSpec::from_yaml_file(&args.job)?;
    let working_dir = spec.working_dir.clone();
    let orchestrator = Arc::new(JobOrchestrator::new(config));

    info!(
        backend = %spec.backend,
        working_dir = %working_dir.display(),
        "Running job from {}",
        args.job.display()
    );

    let task = orchestrator.spawn(spec, args.timeout_secs.map(Duration::from_secs));
    let cancel = task.cancel_handle();
    let join = task.join_job();
    tokio::pin!(join);

    let outcome = tokio::select! {
        outcome = &mut join => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling job");
            cancel.cancel();
            join.await
        }
    }?;
    let job = match outcome {
        JobTaskOutcome::Finished(job) => job,
        JobTaskOutcome::Unfinished { job, error } => {
            warn!(
                job_id = %job.id(),
                backend_id = %job.backend_id(),
                status = %job.status(),
                "Job left running"
            );
            return Err(error.into());
        }
    };
    let result = job
        .result()
        .cloned()
        .context("job ended without a result")?;

    print_summary(&result);

    if !args.no_result_file {
        let path = working_dir.join(RESULT_FILE_NAME);
        write_result(&path, &result)?;
        info!("Result written to {}", path.display());
    }

    if args.cleanup {
        orchestrator.cleanup(&job, &CleanupPolicy::remove_all())?;
    }

    if !result.is_success() {
        anyhow::bail!("job ended {}", result.status);
    }
    Ok(())
}

fn write_result(path: &Path, result: &JobResult) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn print_summary(result: &JobResult) {
    println!("Job {} ({})", result.job_id, result.backend);
    if !result.backend_id.is_empty() {
        println!("  Scheduler id: {}", result.backend_id);
    }
    println!("  Status:       {}", result.status);
    if let Some(cause) = result.cancel_cause {
        println!("  Cancelled by: {}", cause);
    }
    if let Some(failure) = &result.failure {
        println!("  Failure:      {} ({})", failure.message, failure.kind);
    }
    println!(
        "  Duration:     {}s",
        result.duration().num_milliseconds() as f64 / 1000.0
    );
    for artifact in &result.artifacts {
        println!("  Artifact:     {}", artifact.display());
    }
}

fn render_script_command(args: RenderScriptArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let spec = JobSpec::from_yaml_file(&args.job)?;
    spec.validate()?;

    let template_id = spec
        .resources
        .as_ref()
        .and_then(|r| r.template.as_deref())
        .or(config.batch.template.as_deref());
    let template = load_template(template_id)?;
    let ctx = ScriptContext::from_spec(&spec, &config.batch, &config.input_file_name);
    print!("{}", render_script(&template, &ctx)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "cdi-jobs",
            "run",
            "--job",
            "job.yaml",
            "--timeout-secs",
            "600",
            "--cleanup",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.job, PathBuf::from("job.yaml"));
                assert_eq!(args.timeout_secs, Some(600));
                assert!(args.cleanup);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_render_script() {
        let cli =
            Cli::try_parse_from(["cdi-jobs", "render-script", "--job", "job.yaml", "-l", "debug"])
                .unwrap();
        assert!(matches!(cli.command, Commands::RenderScript(_)));
        assert_eq!(cli.log_level, "debug");
    }
}
