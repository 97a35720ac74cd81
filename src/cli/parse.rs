//! CLI parse: clap types for vitae. Definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vitae - resilient CV enhancement pipeline client
#[derive(Parser, Debug)]
#[command(name = "vitae")]
#[command(about = "Checkpointed job execution, live progress and preview merging for CV enhancement jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file layered above the workspace config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes a file)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and clean up recovery checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Inspect the per-attempt recovery log
    Attempts {
        #[command(subcommand)]
        command: AttemptCommands,
    },
    /// Merge feature fragments into a base document
    Merge {
        /// Base HTML document
        #[arg(long)]
        base: PathBuf,
        /// Fragment as feature=path; repeatable
        #[arg(long = "fragment", value_name = "FEATURE=PATH")]
        fragments: Vec<String>,
        /// Comma separated feature order (defaults to the configured order)
        #[arg(long)]
        order: Option<String>,
        /// Skip sandboxing of the merged document
        #[arg(long)]
        no_sandbox: bool,
        /// Write the merged document here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run a job through an in-process feed, hub, aggregator and merger
    Simulate {
        /// Feature to request; repeatable
        #[arg(long = "feature", required = true)]
        features: Vec<String>,
        /// Feature whose generation fails; repeatable
        #[arg(long = "fail")]
        fail: Vec<String>,
        /// Listener debounce window in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,
        /// Job identifier (generated when omitted)
        #[arg(long)]
        job: Option<String>,
        /// Write the merged preview here
        #[arg(long)]
        output: Option<PathBuf>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Evaluate a gating condition against a job's recorded progress
    Gate {
        #[arg(long)]
        job: String,
        /// Condition as JSON, e.g. '{"kind":"checkpointReached","checkpoint":"parsing_completed"}'
        #[arg(long)]
        condition: String,
        /// Extra step to treat as completed; repeatable
        #[arg(long = "step")]
        steps: Vec<String>,
    },
    /// Show or validate the effective configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List checkpoints of a job, oldest first
    List {
        #[arg(long)]
        job: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the most recent checkpoint of a type
    Latest {
        #[arg(long)]
        job: String,
        /// Checkpoint type, e.g. parsing_completed
        #[arg(long = "type")]
        checkpoint_type: String,
    },
    /// Remove checkpoints older than the retention window
    Cleanup,
}

#[derive(Subcommand, Debug)]
pub enum AttemptCommands {
    /// List recorded attempt events of a job
    List {
        #[arg(long)]
        job: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Drop attempt logs of jobs idle for longer than the given hours
    Prune {
        #[arg(long, default_value = "168")]
        max_age_hours: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate configuration and report problems
    Validate,
}
