//! Per-feature progress model derived from live job payloads.

pub mod aggregator;
pub mod state;

pub use aggregator::{
    CompletionOutcome, FeatureCounts, JobProgress, ProgressAggregator, ProgressObserver,
    ProgressState,
};
pub use state::{check_transition, RejectReason, Transition};
