//! Attempt log for recovery telemetry.
//!
//! Every attempt, retry and checkpoint write made by the orchestrator is
//! recorded here for later performance analysis. Recording is best-effort;
//! a failing sink never changes an operation's outcome.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};
use tracing::warn;

use crate::error::{json_to_storage, sled_to_storage, StorageError};
use crate::types::{job_key_prefix, job_seq_key, now_millis, JobId};

const TREE_EVENTS: &str = "attempt_events";
const TREE_META: &str = "attempt_meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptEventType {
    Resumed,
    AttemptStarted,
    AttemptSucceeded,
    AttemptFailed,
    RetryScheduled,
    CheckpointWritten,
    Cancelled,
}

impl AttemptEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptEventType::Resumed => "resumed",
            AttemptEventType::AttemptStarted => "attempt_started",
            AttemptEventType::AttemptSucceeded => "attempt_succeeded",
            AttemptEventType::AttemptFailed => "attempt_failed",
            AttemptEventType::RetryScheduled => "retry_scheduled",
            AttemptEventType::CheckpointWritten => "checkpoint_written",
            AttemptEventType::Cancelled => "cancelled",
        }
    }
}

/// Unsequenced event as produced by the orchestrator.
#[derive(Debug, Clone)]
pub struct AttemptEnvelope {
    pub ts_ms: u64,
    pub job_id: JobId,
    pub operation: String,
    pub event_type: AttemptEventType,
    pub attempt: u32,
    pub data: Value,
}

impl AttemptEnvelope {
    pub fn with_now(
        job_id: &JobId,
        operation: impl Into<String>,
        event_type: AttemptEventType,
        attempt: u32,
        data: Value,
    ) -> Self {
        Self {
            ts_ms: now_millis(),
            job_id: job_id.clone(),
            operation: operation.into(),
            event_type,
            attempt,
            data,
        }
    }
}

/// Stored event with a per-job sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub ts_ms: u64,
    pub job_id: JobId,
    pub seq: u64,
    pub operation: String,
    #[serde(rename = "type")]
    pub event_type: AttemptEventType,
    pub attempt: u32,
    pub data: Value,
}

impl AttemptEvent {
    pub fn from_envelope(envelope: AttemptEnvelope, seq: u64) -> Self {
        Self {
            ts_ms: envelope.ts_ms,
            job_id: envelope.job_id,
            seq,
            operation: envelope.operation,
            event_type: envelope.event_type,
            attempt: envelope.attempt,
            data: envelope.data,
        }
    }
}

pub trait AttemptSink: Send + Sync {
    fn record(&self, envelope: AttemptEnvelope) -> Result<AttemptEvent, StorageError>;

    fn read_events(&self, job_id: &JobId) -> Result<Vec<AttemptEvent>, StorageError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobMeta {
    next_seq: u64,
    updated_at_ms: u64,
}

/// Durable sled-backed attempt store.
#[derive(Clone)]
pub struct AttemptStore {
    db: Db,
    events: Tree,
    meta: Tree,
    // Serialises sequence assignment.
    seq_lock: Arc<Mutex<()>>,
}

impl AttemptStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let events = db.open_tree(TREE_EVENTS).map_err(sled_to_storage)?;
        let meta = db.open_tree(TREE_META).map_err(sled_to_storage)?;
        Ok(Self {
            db,
            events,
            meta,
            seq_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn encode_event_key(job_id: &JobId, seq: u64) -> Vec<u8> {
        job_seq_key(job_id, seq)
    }

    fn get_meta(&self, job_id: &JobId) -> Result<Option<JobMeta>, StorageError> {
        let key = job_id.as_str();
        let Some(raw) = self.meta.get(key.as_bytes()).map_err(sled_to_storage)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(|e| json_to_storage(key, e))?;
        Ok(Some(parsed))
    }

    fn put_meta(&self, job_id: &JobId, meta: &JobMeta) -> Result<(), StorageError> {
        let key = job_id.as_str();
        let value = serde_json::to_vec(meta).map_err(|e| json_to_storage(key, e))?;
        self.meta
            .insert(key.as_bytes(), value)
            .map_err(sled_to_storage)?;
        Ok(())
    }

    /// Drop all events of jobs not updated within `max_age_ms` of `now_ms`.
    pub fn prune(&self, max_age_ms: u64, now_ms: u64) -> Result<usize, StorageError> {
        let mut stale = Vec::new();
        for result in self.meta.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            let job = String::from_utf8_lossy(&key).to_string();
            let meta: JobMeta =
                serde_json::from_slice(&value).map_err(|e| json_to_storage(&job, e))?;
            if now_ms.saturating_sub(meta.updated_at_ms) > max_age_ms {
                stale.push(job);
            }
        }
        for job in &stale {
            self.meta.remove(job.as_bytes()).map_err(sled_to_storage)?;
            let keys: Vec<Vec<u8>> = self
                .events
                .scan_prefix(job_key_prefix(&JobId::from(job.as_str())))
                .filter_map(|r| r.ok().map(|(k, _)| k.to_vec()))
                .collect();
            for key in keys {
                self.events.remove(key).map_err(sled_to_storage)?;
            }
        }
        self.db.flush().map_err(sled_to_storage)?;
        Ok(stale.len())
    }
}

impl AttemptSink for AttemptStore {
    fn record(&self, envelope: AttemptEnvelope) -> Result<AttemptEvent, StorageError> {
        let _guard = self.seq_lock.lock();
        let mut meta = self.get_meta(&envelope.job_id)?.unwrap_or(JobMeta {
            next_seq: 1,
            updated_at_ms: now_millis(),
        });
        let seq = meta.next_seq;
        let event = AttemptEvent::from_envelope(envelope, seq);
        let key = Self::encode_event_key(&event.job_id, seq);
        let value = serde_json::to_vec(&event)
            .map_err(|e| json_to_storage(&String::from_utf8_lossy(&key), e))?;
        self.events
            .insert(key, value)
            .map_err(sled_to_storage)?;
        meta.next_seq += 1;
        meta.updated_at_ms = now_millis();
        self.put_meta(&event.job_id, &meta)?;
        self.db.flush().map_err(sled_to_storage)?;
        Ok(event)
    }

    fn read_events(&self, job_id: &JobId) -> Result<Vec<AttemptEvent>, StorageError> {
        let mut out = Vec::new();
        for result in self.events.scan_prefix(job_key_prefix(job_id)) {
            let (key, value) = result.map_err(sled_to_storage)?;
            let parsed: AttemptEvent = serde_json::from_slice(&value)
                .map_err(|e| json_to_storage(&String::from_utf8_lossy(&key), e))?;
            if parsed.job_id == *job_id {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }
}

/// Volatile sink used by tests and the offline simulator.
#[derive(Default)]
pub struct MemoryAttemptSink {
    events: Mutex<Vec<AttemptEvent>>,
}

impl AttemptSink for MemoryAttemptSink {
    fn record(&self, envelope: AttemptEnvelope) -> Result<AttemptEvent, StorageError> {
        let mut events = self.events.lock();
        let seq = events
            .iter()
            .filter(|e| e.job_id == envelope.job_id)
            .count() as u64
            + 1;
        let event = AttemptEvent::from_envelope(envelope, seq);
        events.push(event.clone());
        Ok(event)
    }

    fn read_events(&self, job_id: &JobId) -> Result<Vec<AttemptEvent>, StorageError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// Handle the orchestrator records through.
#[derive(Clone)]
pub struct AttemptLog {
    sink: Option<Arc<dyn AttemptSink>>,
}

impl AttemptLog {
    pub fn new(sink: Arc<dyn AttemptSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAttemptSink::default()))
    }

    /// Log that only traces and stores nothing.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn record_best_effort(&self, envelope: AttemptEnvelope) {
        let Some(sink) = &self.sink else {
            return;
        };
        let job_id = envelope.job_id.clone();
        let event_type = envelope.event_type;
        if let Err(err) = sink.record(envelope) {
            warn!(
                job_id = %job_id,
                event_type = event_type.as_str(),
                error = %err,
                "failed to record attempt event"
            );
        }
    }

    pub fn read_events(&self, job_id: &JobId) -> Result<Vec<AttemptEvent>, StorageError> {
        match &self.sink {
            Some(sink) => sink.read_events(job_id),
            None => Ok(Vec::new()),
        }
    }
}
