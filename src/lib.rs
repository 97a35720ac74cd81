//! Vitae: resilient client pipeline for CV enhancement jobs
//!
//! Wraps remote job operations in classified retry with durable checkpoints,
//! multiplexes live job feeds to listeners, folds per-feature progress and
//! merges completed feature fragments into a sandboxed preview document.

pub mod cli;
pub mod config;
pub mod error;
pub mod feed;
pub mod gating;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod preview;
pub mod progress;
pub mod recovery;
pub mod types;
