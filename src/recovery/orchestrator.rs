//! Checkpoint-then-retry-then-checkpoint execution of risky operations.
//!
//! [`RecoveryOrchestrator::execute_with_recovery`] never returns an error and
//! never panics: every outcome, including a panic inside the wrapped
//! operation, is reported through [`RecoveryResult`]. Attempts of one call are
//! strictly sequential.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::OperationError;
use crate::recovery::checkpoint::{Checkpoint, CheckpointStore, CheckpointType};
use crate::recovery::retry::{RetryConfig, RetryPolicy};
use crate::recovery::telemetry::{AttemptEnvelope, AttemptEventType, AttemptLog};
use crate::types::JobId;

/// What is being run and which checkpoint documents it.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub operation_name: String,
    pub job_id: JobId,
    pub checkpoint_type: Option<CheckpointType>,
    pub checkpoint_data: Option<Value>,
}

impl RecoveryContext {
    pub fn new(operation_name: impl Into<String>, job_id: JobId) -> Self {
        Self {
            operation_name: operation_name.into(),
            job_id,
            checkpoint_type: None,
            checkpoint_data: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_type: CheckpointType, data: Option<Value>) -> Self {
        self.checkpoint_type = Some(checkpoint_type);
        self.checkpoint_data = data;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub enable_checkpoint_restore: bool,
    pub enable_auto_retry: bool,
    /// Total attempts, including the first one
    pub max_retries: u32,
    pub custom_retry_config: Option<RetryConfig>,
    /// Observed between attempts and during backoff; an attempt already in
    /// flight always runs to completion.
    pub cancel: Option<CancellationToken>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            enable_checkpoint_restore: true,
            enable_auto_retry: true,
            max_retries: 3,
            custom_retry_config: None,
            cancel: None,
        }
    }
}

impl RecoveryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.custom_retry_config = Some(config);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryFailure {
    pub original_error: OperationError,
    pub is_retryable: bool,
    /// Number of attempts made before giving up
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryResult<T> {
    Success {
        data: T,
        attempts: u32,
        resumed_from: Option<Checkpoint>,
    },
    Failure(RecoveryFailure),
}

impl<T> RecoveryResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryResult::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            RecoveryResult::Success { data, .. } => Some(data),
            RecoveryResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RecoveryFailure> {
        match self {
            RecoveryResult::Success { .. } => None,
            RecoveryResult::Failure(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<T, RecoveryFailure> {
        match self {
            RecoveryResult::Success { data, .. } => Ok(data),
            RecoveryResult::Failure(failure) => Err(failure),
        }
    }
}

/// Ephemeral per-call attempt state.
#[derive(Debug)]
struct RecoveryAttempt<'a> {
    context: &'a RecoveryContext,
    attempt_number: u32,
    last_error: Option<OperationError>,
    next_delay: Option<Duration>,
}

#[derive(Clone)]
pub struct RecoveryOrchestrator {
    checkpoints: CheckpointStore,
    log: AttemptLog,
    policy: RetryPolicy,
    default_retry: RetryConfig,
}

impl RecoveryOrchestrator {
    pub fn new(checkpoints: CheckpointStore, log: AttemptLog) -> Self {
        Self {
            checkpoints,
            log,
            policy: RetryPolicy::default(),
            default_retry: RetryConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy, default_retry: RetryConfig) -> Self {
        self.policy = policy;
        self.default_retry = default_retry;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn attempt_log(&self) -> &AttemptLog {
        &self.log
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` with classified retry and checkpointing.
    ///
    /// A prior checkpoint of `context.checkpoint_type` marks the call as a
    /// resume and is returned in `resumed_from`, but the operation is still
    /// attempted. Use [`execute_with_restore`](Self::execute_with_restore) to
    /// treat a checkpoint as terminal.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        operation: F,
        context: &RecoveryContext,
        options: &RecoveryOptions,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let resumed_from = self.find_resume_point(context, options);
        self.run_attempts(operation, context, options, resumed_from, |_| None)
            .await
    }

    /// Like [`execute_with_recovery`](Self::execute_with_recovery), but when
    /// `is_terminal` accepts an existing checkpoint whose stored result
    /// decodes as `T`, the operation is skipped and that result returned with
    /// zero attempts.
    pub async fn execute_with_restore<T, F, Fut, P>(
        &self,
        operation: F,
        context: &RecoveryContext,
        options: &RecoveryOptions,
        is_terminal: P,
    ) -> RecoveryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        P: Fn(&Checkpoint) -> bool,
    {
        let resumed_from = self.find_resume_point(context, options);
        if let Some(checkpoint) = resumed_from.as_ref().filter(|c| is_terminal(c)) {
            let stored = checkpoint
                .payload
                .get("result")
                .cloned()
                .map(serde_json::from_value::<T>);
            match stored {
                Some(Ok(data)) => {
                    info!(
                        job_id = %context.job_id,
                        operation = %context.operation_name,
                        checkpoint_id = %checkpoint.id,
                        "restored result from checkpoint, skipping execution"
                    );
                    return RecoveryResult::Success {
                        data,
                        attempts: 0,
                        resumed_from: resumed_from.clone(),
                    };
                }
                Some(Err(err)) => warn!(
                    job_id = %context.job_id,
                    checkpoint_id = %checkpoint.id,
                    error = %err,
                    "terminal checkpoint result unreadable, re-executing"
                ),
                None => debug!(
                    job_id = %context.job_id,
                    checkpoint_id = %checkpoint.id,
                    "terminal checkpoint carries no result, re-executing"
                ),
            }
        }
        self.run_attempts(operation, context, options, resumed_from, |data: &T| {
            serde_json::to_value(data).ok()
        })
        .await
    }

    fn find_resume_point(
        &self,
        context: &RecoveryContext,
        options: &RecoveryOptions,
    ) -> Option<Checkpoint> {
        if !options.enable_checkpoint_restore {
            return None;
        }
        let checkpoint_type = context.checkpoint_type?;
        let checkpoint = self.checkpoints.latest(&context.job_id, checkpoint_type)?;
        info!(
            job_id = %context.job_id,
            operation = %context.operation_name,
            checkpoint_type = %checkpoint_type,
            checkpoint_id = %checkpoint.id,
            "resuming from checkpoint"
        );
        self.record(
            context,
            AttemptEventType::Resumed,
            0,
            json!({ "checkpoint_id": checkpoint.id, "created_at_ms": checkpoint.created_at_ms }),
        );
        Some(checkpoint)
    }

    async fn run_attempts<T, F, Fut, E>(
        &self,
        mut operation: F,
        context: &RecoveryContext,
        options: &RecoveryOptions,
        resumed_from: Option<Checkpoint>,
        encode_result: E,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        E: Fn(&T) -> Option<Value>,
    {
        let retry_config = options.custom_retry_config.unwrap_or(self.default_retry);
        let mut state = RecoveryAttempt {
            context,
            attempt_number: 0,
            last_error: None,
            next_delay: None,
        };

        loop {
            if is_cancelled(options) {
                return self.cancelled(&state);
            }
            state.attempt_number += 1;
            let attempt = state.attempt_number;
            self.record(context, AttemptEventType::AttemptStarted, attempt, json!({}));
            let started = Instant::now();

            let outcome = match AssertUnwindSafe(operation()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(OperationError::Other(format!(
                    "operation panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(data) => {
                    self.record(
                        context,
                        AttemptEventType::AttemptSucceeded,
                        attempt,
                        json!({ "duration_ms": duration_ms }),
                    );
                    info!(
                        job_id = %context.job_id,
                        operation = %context.operation_name,
                        attempt,
                        duration_ms,
                        "operation succeeded"
                    );
                    self.write_completion_checkpoint(context, attempt, encode_result(&data));
                    return RecoveryResult::Success {
                        data,
                        attempts: attempt,
                        resumed_from,
                    };
                }
                Err(error) => error,
            };

            let classification = self.policy.classify(&error);
            let limit = self
                .policy
                .attempt_limit(&classification, options.max_retries);
            self.record(
                context,
                AttemptEventType::AttemptFailed,
                attempt,
                json!({
                    "duration_ms": duration_ms,
                    "error": error.to_string(),
                    "retryable": classification.retryable,
                    "reason": classification.reason,
                }),
            );

            let exhausted = attempt >= limit;
            if !classification.retryable || !options.enable_auto_retry || exhausted {
                warn!(
                    job_id = %context.job_id,
                    operation = %context.operation_name,
                    attempt,
                    retryable = classification.retryable,
                    reason = %classification.reason,
                    error = %error,
                    "operation failed permanently"
                );
                return RecoveryResult::Failure(RecoveryFailure {
                    original_error: error,
                    is_retryable: classification.retryable,
                    attempt,
                });
            }

            let delay = self.policy.next_delay(attempt, &retry_config);
            state.last_error = Some(error);
            state.next_delay = Some(delay);
            self.record(
                context,
                AttemptEventType::RetryScheduled,
                attempt,
                json!({ "delay_ms": delay.as_millis() as u64 }),
            );
            warn!(
                job_id = %context.job_id,
                operation = %context.operation_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?state.last_error,
                "operation failed, retrying"
            );

            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return self.cancelled(&state),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn cancelled<T>(&self, state: &RecoveryAttempt<'_>) -> RecoveryResult<T> {
        info!(
            job_id = %state.context.job_id,
            operation = %state.context.operation_name,
            attempts = state.attempt_number,
            pending_delay_ms = state.next_delay.map(|d| d.as_millis() as u64),
            "operation cancelled"
        );
        self.record(
            state.context,
            AttemptEventType::Cancelled,
            state.attempt_number,
            json!({ "last_error": state.last_error.as_ref().map(|e| e.to_string()) }),
        );
        RecoveryResult::Failure(RecoveryFailure {
            original_error: OperationError::Cancelled,
            is_retryable: false,
            attempt: state.attempt_number,
        })
    }

    fn write_completion_checkpoint(
        &self,
        context: &RecoveryContext,
        attempts: u32,
        result: Option<Value>,
    ) {
        let Some(checkpoint_type) = context.checkpoint_type else {
            return;
        };
        let mut payload = json!({
            "operation": context.operation_name,
            "attempts": attempts,
            "data": context.checkpoint_data.clone().unwrap_or(Value::Null),
        });
        if let (Some(result), Some(map)) = (result, payload.as_object_mut()) {
            map.insert("result".to_string(), result);
        }
        let checkpoint = self.checkpoints.create(
            &context.job_id,
            checkpoint_type,
            payload,
            format!("{} completed", context.operation_name),
        );
        self.record(
            context,
            AttemptEventType::CheckpointWritten,
            attempts,
            json!({ "checkpoint_id": checkpoint.id, "checkpoint_type": checkpoint_type }),
        );
    }

    fn record(
        &self,
        context: &RecoveryContext,
        event_type: AttemptEventType,
        attempt: u32,
        data: Value,
    ) {
        self.log.record_best_effort(AttemptEnvelope::with_now(
            &context.job_id,
            context.operation_name.clone(),
            event_type,
            attempt,
            data,
        ));
    }
}

fn is_cancelled(options: &RecoveryOptions) -> bool {
    options
        .cancel
        .as_ref()
        .map(|t| t.is_cancelled())
        .unwrap_or(false)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
