//! Command-line interface for cdi-jobs.
//!
//! Provides commands to run a phase-retrieval job and to preview the
//! submission script a batch job would use.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RenderScriptArgs, RunArgs, RESULT_FILE_NAME};
