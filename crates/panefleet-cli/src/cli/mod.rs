//! CLI command definitions for the `pfleet` binary.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-step workflows across a fleet of AI agent workers.
#[derive(Parser)]
#[command(name = "pfleet", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml and workflows/.
    #[arg(long, global = true, env = "PANEFLEET_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow file.
    Validate {
        /// Path to a .yaml, .yml or .toml workflow.
        file: PathBuf,
    },

    /// Show the leveled execution plan of a workflow.
    Plan {
        file: PathBuf,
    },

    /// Execute a workflow.
    Run {
        /// Workflow file, or the name of a workflow in the workflows directory.
        workflow: String,

        /// Variable override (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Variable overrides as a JSON object.
        #[arg(long)]
        vars_json: Option<String>,

        /// Worker session name.
        #[arg(long)]
        session: Option<String>,

        /// Report what would be sent without contacting workers.
        #[arg(long)]
        dry_run: bool,

        /// Use this run id instead of generating one.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// List workflows in the workflows directory.
    #[command(alias = "ls")]
    List,

    /// Print the JSON schema of the workflow file format.
    Schema,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
