//! Integration tests for the vitae enhancement pipeline

mod cli_commands;
mod config_integration;
mod feed_hub;
mod job_pipeline;
mod preview_order;
mod recovery_resilience;
