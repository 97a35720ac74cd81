//! Dotted command names used in logs.

use crate::cli::parse::{AttemptCommands, CheckpointCommands, Commands, ConfigCommands};

/// Command name such as "checkpoints.list" or "simulate".
pub fn command_name(command: &Commands) -> String {
    match command {
        Commands::Checkpoints { command } => {
            format!("checkpoints.{}", checkpoint_command_name(command))
        }
        Commands::Attempts { command } => format!("attempts.{}", attempt_command_name(command)),
        Commands::Merge { .. } => "merge".to_string(),
        Commands::Simulate { .. } => "simulate".to_string(),
        Commands::Gate { .. } => "gate".to_string(),
        Commands::Config { command } => format!("config.{}", config_command_name(command)),
    }
}

fn checkpoint_command_name(command: &CheckpointCommands) -> &'static str {
    match command {
        CheckpointCommands::List { .. } => "list",
        CheckpointCommands::Latest { .. } => "latest",
        CheckpointCommands::Cleanup => "cleanup",
    }
}

fn attempt_command_name(command: &AttemptCommands) -> &'static str {
    match command {
        AttemptCommands::List { .. } => "list",
        AttemptCommands::Prune { .. } => "prune",
    }
}

fn config_command_name(command: &ConfigCommands) -> &'static str {
    match command {
        ConfigCommands::Show => "show",
        ConfigCommands::Validate => "validate",
    }
}
