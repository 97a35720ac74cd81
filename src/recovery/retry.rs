//! Failure classification and backoff computation.
//!
//! Pure functions of an error and an attempt count; nothing here sleeps or
//! logs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// Backoff tuning for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Expensive media generation (audio, video).
    pub fn media() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }

    /// Lightweight preview rendering.
    pub fn preview() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout, server busy
    Transient,
    /// Authentication, validation
    Fatal,
    /// Anything not recognised; retried under a tighter cap
    Unclassified,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub class: FailureClass,
    pub reason: String,
}

/// Classifies failures and computes backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts granted to unclassified failures, regardless of the
    /// caller's `max_retries`.
    #[serde(default = "default_unclassified_cap")]
    pub unclassified_cap: u32,
}

fn default_unclassified_cap() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unclassified_cap: default_unclassified_cap(),
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "unavailable",
    "503",
    "502",
    "504",
    "429",
    "econnreset",
    "deadline exceeded",
];

const FATAL_MARKERS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "permission denied",
    "forbidden",
    "401",
    "403",
    "invalid",
    "validation",
];

impl RetryPolicy {
    pub fn classify(&self, error: &OperationError) -> Classification {
        let (class, reason) = match error {
            OperationError::Network(_) => (FailureClass::Transient, "network error".to_string()),
            OperationError::Timeout(_) => (FailureClass::Transient, "timeout".to_string()),
            OperationError::ServerUnavailable(_) => {
                (FailureClass::Transient, "server unavailable".to_string())
            }
            OperationError::RateLimited(_) => (FailureClass::Transient, "rate limited".to_string()),
            OperationError::Authentication(_) => {
                (FailureClass::Fatal, "authentication failure".to_string())
            }
            OperationError::Validation(_) => (FailureClass::Fatal, "invalid input".to_string()),
            OperationError::Cancelled => (FailureClass::Cancelled, "cancelled".to_string()),
            OperationError::Other(message) => classify_message(message),
        };
        Classification {
            retryable: matches!(class, FailureClass::Transient | FailureClass::Unclassified),
            class,
            reason,
        }
    }

    /// Total attempts allowed for a failure of this classification.
    pub fn attempt_limit(&self, classification: &Classification, max_retries: u32) -> u32 {
        let requested = max_retries.max(1);
        match classification.class {
            FailureClass::Transient => requested,
            FailureClass::Unclassified => requested.min(self.unclassified_cap.max(1)),
            FailureClass::Fatal | FailureClass::Cancelled => 1,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn next_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        next_delay(attempt, config)
    }
}

/// Markers match whole words, so "invalid" does not fire on "invalidated"
/// and "401" does not fire on "4010ms".
fn classify_message(message: &str) -> (FailureClass, String) {
    let lowered = message.to_ascii_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if let Some(marker) = FATAL_MARKERS.iter().find(|m| has_marker(&words, m)) {
        return (FailureClass::Fatal, format!("matched fatal marker '{marker}'"));
    }
    if let Some(marker) = TRANSIENT_MARKERS.iter().find(|m| has_marker(&words, m)) {
        return (
            FailureClass::Transient,
            format!("matched transient marker '{marker}'"),
        );
    }
    (FailureClass::Unclassified, "unclassified error".to_string())
}

fn has_marker(words: &[&str], marker: &str) -> bool {
    let needle: Vec<&str> = marker.split(' ').collect();
    words.windows(needle.len()).any(|window| window == needle.as_slice())
}

/// Exponential backoff: `initial * multiplier^(attempt-1)`, clamped to `max`.
pub fn next_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let raw = config.initial_delay_ms as f64 * config.multiplier.max(1.0).powi(exponent);
    let clamped = raw.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(clamped as u64)
}
