//! Detection of infrastructure instability in the feed client.
//!
//! Individual feed errors are handled by resubscribing. A burst of internal
//! assertion failures within a short window means the client itself is
//! wedged; incremental retry does not help there, so the monitor runs a
//! heavyweight reset instead: disable network, clear the local cache,
//! re-enable network, then wait for the connection to stabilise.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::FeedError;

/// Hooks into the feed client used by the heavyweight reset.
#[async_trait]
pub trait InfrastructureReset: Send + Sync {
    async fn disable_network(&self) -> Result<(), FeedError>;

    async fn clear_local_cache(&self) -> Result<(), FeedError>;

    async fn enable_network(&self) -> Result<(), FeedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstabilityConfig {
    /// Internal errors within the window that trigger a reset
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Rolling window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Pause after re-enabling the network
    #[serde(default = "default_stabilization_ms")]
    pub stabilization_ms: u64,
}

fn default_threshold() -> usize {
    3
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_stabilization_ms() -> u64 {
    2_000
}

impl Default for InstabilityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_ms: default_window_ms(),
            stabilization_ms: default_stabilization_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The error is not of the counted class.
    Ignored,
    BelowThreshold { count: usize },
    /// Another reset is already running.
    InProgress,
    Reset,
    ResetFailed(String),
}

#[derive(Default)]
struct MonitorState {
    occurrences: VecDeque<Instant>,
    resetting: bool,
    resets: u64,
}

pub struct InstabilityMonitor {
    config: InstabilityConfig,
    reset: Arc<dyn InfrastructureReset>,
    state: Mutex<MonitorState>,
}

impl InstabilityMonitor {
    pub fn new(config: InstabilityConfig, reset: Arc<dyn InfrastructureReset>) -> Self {
        Self {
            config,
            reset,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn resets(&self) -> u64 {
        self.state.lock().resets
    }

    /// Count `error` and run the reset once the threshold is crossed.
    pub async fn report(&self, error: &FeedError) -> ResetOutcome {
        if !error.is_internal() {
            return ResetOutcome::Ignored;
        }
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        {
            let mut state = self.state.lock();
            while let Some(front) = state.occurrences.front() {
                if now.duration_since(*front) > window {
                    state.occurrences.pop_front();
                } else {
                    break;
                }
            }
            state.occurrences.push_back(now);
            let count = state.occurrences.len();
            if state.resetting {
                return ResetOutcome::InProgress;
            }
            if count < self.config.threshold.max(1) {
                return ResetOutcome::BelowThreshold { count };
            }
            state.resetting = true;
            state.occurrences.clear();
        }

        warn!(
            threshold = self.config.threshold,
            window_ms = self.config.window_ms,
            "feed instability detected, resetting connection"
        );
        let outcome = match self.run_reset().await {
            Ok(()) => {
                info!("feed connection reset completed");
                ResetOutcome::Reset
            }
            Err(err) => {
                error!(error = %err, "feed connection reset failed");
                ResetOutcome::ResetFailed(err.to_string())
            }
        };

        let mut state = self.state.lock();
        state.resetting = false;
        state.resets += 1;
        outcome
    }

    async fn run_reset(&self) -> Result<(), FeedError> {
        self.reset.disable_network().await?;
        let cleared = self.reset.clear_local_cache().await;
        // Network comes back even when the cache could not be cleared.
        self.reset.enable_network().await?;
        cleared?;
        tokio::time::sleep(Duration::from_millis(self.config.stabilization_ms)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingReset {
        calls: Mutex<Vec<&'static str>>,
        fail_clear: bool,
    }

    #[async_trait]
    impl InfrastructureReset for RecordingReset {
        async fn disable_network(&self) -> Result<(), FeedError> {
            self.calls.lock().push("disable");
            Ok(())
        }

        async fn clear_local_cache(&self) -> Result<(), FeedError> {
            self.calls.lock().push("clear");
            if self.fail_clear {
                return Err(FeedError::Internal("cache locked".into()));
            }
            Ok(())
        }

        async fn enable_network(&self) -> Result<(), FeedError> {
            self.calls.lock().push("enable");
            Ok(())
        }
    }

    fn internal() -> FeedError {
        FeedError::Internal("ASSERTION FAILED: unexpected state".into())
    }

    #[tokio::test(start_paused = true)]
    async fn resets_after_threshold_within_window() {
        let reset = Arc::new(RecordingReset::default());
        let monitor = InstabilityMonitor::new(InstabilityConfig::default(), reset.clone());

        assert_eq!(
            monitor.report(&internal()).await,
            ResetOutcome::BelowThreshold { count: 1 }
        );
        assert_eq!(
            monitor.report(&internal()).await,
            ResetOutcome::BelowThreshold { count: 2 }
        );
        assert_eq!(monitor.report(&internal()).await, ResetOutcome::Reset);
        assert_eq!(*reset.calls.lock(), vec!["disable", "clear", "enable"]);
        assert_eq!(monitor.resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn old_errors_fall_out_of_window() {
        let reset = Arc::new(RecordingReset::default());
        let monitor = InstabilityMonitor::new(
            InstabilityConfig {
                threshold: 2,
                window_ms: 1_000,
                stabilization_ms: 10,
            },
            reset.clone(),
        );
        monitor.report(&internal()).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(
            monitor.report(&internal()).await,
            ResetOutcome::BelowThreshold { count: 1 }
        );
        assert!(reset.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_not_counted() {
        let reset = Arc::new(RecordingReset::default());
        let monitor = InstabilityMonitor::new(InstabilityConfig::default(), reset);
        let outcome = monitor
            .report(&FeedError::Disconnected("socket closed".into()))
            .await;
        assert_eq!(outcome, ResetOutcome::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_clear_still_reenables_network() {
        let reset = Arc::new(RecordingReset {
            fail_clear: true,
            ..Default::default()
        });
        let monitor = InstabilityMonitor::new(
            InstabilityConfig {
                threshold: 1,
                ..Default::default()
            },
            reset.clone(),
        );
        let outcome = monitor.report(&internal()).await;
        assert!(matches!(outcome, ResetOutcome::ResetFailed(_)));
        assert_eq!(*reset.calls.lock(), vec!["disable", "clear", "enable"]);
    }
}
