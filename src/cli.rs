//! CLI domain: parse, route, help, output, and presentation only.
//! No domain orchestration; a single route table dispatches to the pipeline services.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::command_name;
pub use output::{map_error, to_json};
pub use parse::{AttemptCommands, CheckpointCommands, Cli, Commands, ConfigCommands};
pub use presentation::{
    format_attempts_text, format_checkpoint_detail, format_checkpoints_text,
    format_simulation_text,
};
pub use route::{FeatureRow, RunContext, SimulationSummary};
