//! Orchestrator behaviour against a sled-backed checkpoint store.

use std::cell::Cell;

use serde_json::json;
use tempfile::TempDir;
use vitae::error::OperationError;
use vitae::recovery::{
    AttemptEventType, AttemptLog, AttemptStore, CheckpointConfig, CheckpointStore, CheckpointType,
    OperationKind, RecoveryContext, RecoveryOptions, RecoveryOrchestrator, RecoveryResult,
    RetryConfig, RetryPolicy,
};
use vitae::types::JobId;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
    }
}

fn open(dir: &TempDir) -> (sled::Db, RecoveryOrchestrator) {
    let db = sled::open(dir.path().join("store")).unwrap();
    let checkpoints = CheckpointStore::sled(db.clone(), CheckpointConfig::default()).unwrap();
    let attempts = std::sync::Arc::new(AttemptStore::new(db.clone()).unwrap());
    let orchestrator = RecoveryOrchestrator::new(checkpoints, AttemptLog::new(attempts))
        .with_policy(RetryPolicy::default(), fast_retry());
    (db, orchestrator)
}

#[tokio::test]
async fn transient_failures_are_retried_and_checkpointed() {
    let dir = TempDir::new().unwrap();
    let (_db, orchestrator) = open(&dir);
    let job_id = JobId::from("job-transient");
    let calls = Cell::new(0u32);

    let context = RecoveryContext::new("parse_document", job_id.clone())
        .with_checkpoint(CheckpointType::ParsingCompleted, Some(json!({"pages": 2})));
    let options = RecoveryOptions::default().with_retry_config(fast_retry());
    let result = orchestrator
        .execute_with_recovery(
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(OperationError::Network("connection reset".into()))
                    } else {
                        Ok("parsed")
                    }
                }
            },
            &context,
            &options,
        )
        .await;

    match result {
        RecoveryResult::Success { data, attempts, .. } => {
            assert_eq!(data, "parsed");
            assert_eq!(attempts, 3);
        }
        RecoveryResult::Failure(failure) => panic!("unexpected failure: {failure:?}"),
    }
    let checkpoint = orchestrator
        .checkpoints()
        .latest(&job_id, CheckpointType::ParsingCompleted)
        .expect("checkpoint written on success");
    assert_eq!(checkpoint.payload["pages"], 2);

    let events = orchestrator.attempt_log().read_events(&job_id).unwrap();
    let failures = events
        .iter()
        .filter(|e| e.event_type == AttemptEventType::AttemptFailed)
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn fatal_failure_stops_after_one_attempt() {
    let dir = TempDir::new().unwrap();
    let (_db, orchestrator) = open(&dir);
    let job_id = JobId::from("job-fatal");
    let calls = Cell::new(0u32);

    let result: RecoveryResult<()> = orchestrator
        .run(OperationKind::IngestFile, job_id.clone(), None, || {
            calls.set(calls.get() + 1);
            async { Err(OperationError::Authentication("token expired".into())) }
        })
        .await;

    let failure = result.into_result().unwrap_err();
    assert!(!failure.is_retryable);
    assert_eq!(failure.attempt, 1);
    assert_eq!(calls.get(), 1);
    assert!(orchestrator.checkpoints().list_for_job(&job_id).is_empty());
}

#[tokio::test]
async fn checkpoints_survive_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    let job_id = JobId::from("job-reopen");
    {
        let (db, orchestrator) = open(&dir);
        let result = orchestrator
            .run(OperationKind::ParseDocument, job_id.clone(), None, || async {
                Ok::<_, OperationError>(42u32)
            })
            .await;
        assert!(result.is_success());
        db.flush().unwrap();
    }

    let (_db, orchestrator) = open(&dir);
    let listed = orchestrator.checkpoints().list_for_job(&job_id);
    assert_eq!(listed.len(), 1);

    // A second run of the same operation resumes from the stored checkpoint.
    let result = orchestrator
        .run(OperationKind::ParseDocument, job_id.clone(), None, || async {
            Ok::<_, OperationError>(43u32)
        })
        .await;
    match result {
        RecoveryResult::Success { resumed_from, .. } => {
            assert_eq!(resumed_from.map(|c| c.id), Some(listed[0].id.clone()));
        }
        RecoveryResult::Failure(failure) => panic!("unexpected failure: {failure:?}"),
    }
}
