//! Write-once job checkpoints.
//!
//! A checkpoint marks a pipeline milestone for one job. Checkpoints are only
//! ever appended and later dropped by expiry; nothing rewrites one in place.
//! Persistence is best-effort from the caller's point of view: [`CheckpointStore`]
//! logs backend failures instead of surfacing them.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::error::{json_to_storage, sled_to_storage, StorageError};
use crate::types::{job_key_prefix, job_seq_key, new_checkpoint_id, now_millis, JobId};

const TREE_CHECKPOINTS: &str = "checkpoints";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    FileUploaded,
    ParsingStarted,
    ParsingCompleted,
    AnalysisStarted,
    AnalysisCompleted,
    GenerationStarted,
    GenerationCompleted,
    ImprovementsApplied,
    PreviewGenerated,
    FeatureCompleted,
}

impl CheckpointType {
    pub const ALL: [CheckpointType; 10] = [
        CheckpointType::FileUploaded,
        CheckpointType::ParsingStarted,
        CheckpointType::ParsingCompleted,
        CheckpointType::AnalysisStarted,
        CheckpointType::AnalysisCompleted,
        CheckpointType::GenerationStarted,
        CheckpointType::GenerationCompleted,
        CheckpointType::ImprovementsApplied,
        CheckpointType::PreviewGenerated,
        CheckpointType::FeatureCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::FileUploaded => "file_uploaded",
            CheckpointType::ParsingStarted => "parsing_started",
            CheckpointType::ParsingCompleted => "parsing_completed",
            CheckpointType::AnalysisStarted => "analysis_started",
            CheckpointType::AnalysisCompleted => "analysis_completed",
            CheckpointType::GenerationStarted => "generation_started",
            CheckpointType::GenerationCompleted => "generation_completed",
            CheckpointType::ImprovementsApplied => "improvements_applied",
            CheckpointType::PreviewGenerated => "preview_generated",
            CheckpointType::FeatureCompleted => "feature_completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().replace('-', "_").to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == normalized)
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub job_id: JobId,
    pub checkpoint_type: CheckpointType,
    pub payload: Value,
    pub description: String,
    pub created_at_ms: u64,
}

impl Checkpoint {
    pub fn new(
        job_id: JobId,
        checkpoint_type: CheckpointType,
        payload: Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: new_checkpoint_id(),
            job_id,
            checkpoint_type,
            payload,
            description: description.into(),
            created_at_ms: now_millis(),
        }
    }
}

/// Document store holding checkpoints, keyed by job.
///
/// `list_for_job` and `list_all` return checkpoints in the order they were
/// appended.
pub trait CheckpointBackend: Send + Sync {
    fn append(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Checkpoint>, StorageError>;

    fn list_all(&self) -> Result<Vec<Checkpoint>, StorageError>;

    fn remove(&self, checkpoint_id: &str) -> Result<bool, StorageError>;
}

/// Durable sled-backed checkpoint backend.
#[derive(Clone)]
pub struct SledCheckpointBackend {
    db: Db,
    checkpoints: Tree,
}

impl SledCheckpointBackend {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let checkpoints = db.open_tree(TREE_CHECKPOINTS).map_err(sled_to_storage)?;
        Ok(Self { db, checkpoints })
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<Checkpoint, StorageError> {
        serde_json::from_slice(value)
            .map_err(|e| json_to_storage(&String::from_utf8_lossy(key), e))
    }
}

impl CheckpointBackend for SledCheckpointBackend {
    fn append(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let seq = self.db.generate_id().map_err(sled_to_storage)?;
        let key = job_seq_key(&checkpoint.job_id, seq);
        let value = serde_json::to_vec(checkpoint)
            .map_err(|e| json_to_storage(&String::from_utf8_lossy(&key), e))?;
        self.checkpoints
            .insert(key, value)
            .map_err(sled_to_storage)?;
        self.db.flush().map_err(sled_to_storage)?;
        Ok(())
    }

    fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Checkpoint>, StorageError> {
        let mut out = Vec::new();
        for result in self.checkpoints.scan_prefix(job_key_prefix(job_id)) {
            let (key, value) = result.map_err(sled_to_storage)?;
            let checkpoint = Self::decode(&key, &value)?;
            if checkpoint.job_id == *job_id {
                out.push(checkpoint);
            }
        }
        Ok(out)
    }

    fn list_all(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let mut out = Vec::new();
        for result in self.checkpoints.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            out.push(Self::decode(&key, &value)?);
        }
        Ok(out)
    }

    fn remove(&self, checkpoint_id: &str) -> Result<bool, StorageError> {
        let mut target = None;
        for result in self.checkpoints.iter() {
            let (key, value) = result.map_err(sled_to_storage)?;
            if Self::decode(&key, &value)?.id == checkpoint_id {
                target = Some(key);
                break;
            }
        }
        let Some(key) = target else {
            return Ok(false);
        };
        self.checkpoints.remove(key).map_err(sled_to_storage)?;
        self.db.flush().map_err(sled_to_storage)?;
        Ok(true)
    }
}

/// In-process backend for tests and offline simulation.
#[derive(Default)]
pub struct MemoryCheckpointBackend {
    entries: RwLock<Vec<Checkpoint>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointBackend for MemoryCheckpointBackend {
    fn append(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.entries.write().push(checkpoint.clone());
        Ok(())
    }

    fn list_for_job(&self, job_id: &JobId) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|c| &c.job_id == job_id)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self.entries.read().clone())
    }

    fn remove(&self, checkpoint_id: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|c| c.id != checkpoint_id);
        Ok(entries.len() != before)
    }
}

/// Checkpoint retention configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoints older than this are removed by cleanup
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

fn default_retention_ms() -> u64 {
    1000 * 60 * 60 * 24 * 7
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
        }
    }
}

/// Best-effort facade over a [`CheckpointBackend`].
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    config: CheckpointConfig,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, config: CheckpointConfig) -> Self {
        Self { backend, config }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCheckpointBackend::new()),
            CheckpointConfig::default(),
        )
    }

    pub fn sled(db: Db, config: CheckpointConfig) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(SledCheckpointBackend::new(db)?), config))
    }

    /// Append a checkpoint. Never fails: a persistence error is logged and the
    /// built checkpoint is still returned.
    pub fn create(
        &self,
        job_id: &JobId,
        checkpoint_type: CheckpointType,
        payload: Value,
        description: impl Into<String>,
    ) -> Checkpoint {
        let checkpoint = Checkpoint::new(job_id.clone(), checkpoint_type, payload, description);
        match self.backend.append(&checkpoint) {
            Ok(()) => debug!(
                job_id = %job_id,
                checkpoint_type = %checkpoint_type,
                checkpoint_id = %checkpoint.id,
                "checkpoint created"
            ),
            Err(err) => warn!(
                job_id = %job_id,
                checkpoint_type = %checkpoint_type,
                error = %err,
                "failed to persist checkpoint"
            ),
        }
        checkpoint
    }

    pub fn latest(&self, job_id: &JobId, checkpoint_type: CheckpointType) -> Option<Checkpoint> {
        self.list_for_job(job_id)
            .into_iter()
            .rev()
            .find(|c| c.checkpoint_type == checkpoint_type)
    }

    /// Checkpoints for a job, oldest first. Read failures yield an empty list.
    pub fn list_for_job(&self, job_id: &JobId) -> Vec<Checkpoint> {
        match self.backend.list_for_job(job_id) {
            Ok(list) => list,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to read checkpoints");
                Vec::new()
            }
        }
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(now_millis())
    }

    /// Remove checkpoints older than the retention window relative to `now_ms`.
    pub fn cleanup_expired_at(&self, now_ms: u64) -> usize {
        let all = match self.backend.list_all() {
            Ok(all) => all,
            Err(err) => {
                warn!(error = %err, "failed to scan checkpoints for cleanup");
                return 0;
            }
        };
        let mut removed = 0usize;
        for checkpoint in all {
            let age = now_ms.saturating_sub(checkpoint.created_at_ms);
            if age <= self.config.retention_ms {
                continue;
            }
            match self.backend.remove(&checkpoint.id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    checkpoint_id = %checkpoint.id,
                    error = %err,
                    "failed to remove expired checkpoint"
                ),
            }
        }
        if removed > 0 {
            debug!(removed, "expired checkpoints removed");
        }
        removed
    }

    pub fn retention_ms(&self) -> u64 {
        self.config.retention_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct BrokenBackend;

    impl CheckpointBackend for BrokenBackend {
        fn append(&self, _: &Checkpoint) -> Result<(), StorageError> {
            Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk gone",
            )))
        }
        fn list_for_job(&self, _: &JobId) -> Result<Vec<Checkpoint>, StorageError> {
            Err(StorageError::CheckpointNotFound("all".into()))
        }
        fn list_all(&self) -> Result<Vec<Checkpoint>, StorageError> {
            Err(StorageError::CheckpointNotFound("all".into()))
        }
        fn remove(&self, _: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[test]
    fn sled_lookups_do_not_leak_across_prefixed_job_ids() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = CheckpointStore::sled(db, CheckpointConfig::default()).unwrap();
        let acme = JobId::from("acme");
        let retry = JobId::from("acme:retry");
        store.create(&retry, CheckpointType::ParsingCompleted, json!({"owner": "retry"}), "parsed");

        assert!(store.list_for_job(&acme).is_empty());
        assert!(store.latest(&acme, CheckpointType::ParsingCompleted).is_none());

        store.create(&acme, CheckpointType::ParsingCompleted, json!({"owner": "acme"}), "parsed");
        let own = store.latest(&acme, CheckpointType::ParsingCompleted).unwrap();
        assert_eq!(own.job_id, acme);
        assert_eq!(store.list_for_job(&retry).len(), 1);
    }

    #[test]
    fn latest_returns_newest_of_type() {
        let store = CheckpointStore::in_memory();
        let job = JobId::from("job-1");
        store.create(&job, CheckpointType::GenerationStarted, json!({"n": 1}), "first");
        store.create(&job, CheckpointType::ParsingCompleted, json!({}), "parse");
        store.create(&job, CheckpointType::GenerationStarted, json!({"n": 2}), "second");

        let latest = store
            .latest(&job, CheckpointType::GenerationStarted)
            .expect("checkpoint exists");
        assert_eq!(latest.payload, json!({"n": 2}));
        assert!(store
            .latest(&job, CheckpointType::ImprovementsApplied)
            .is_none());
        assert_eq!(store.list_for_job(&job).len(), 3);
    }

    #[test]
    fn broken_backend_never_fails_caller() {
        let store = CheckpointStore::new(Arc::new(BrokenBackend), CheckpointConfig::default());
        let job = JobId::from("job-1");
        let checkpoint = store.create(&job, CheckpointType::FileUploaded, json!({}), "upload");
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::FileUploaded);
        assert!(store.latest(&job, CheckpointType::FileUploaded).is_none());
        assert_eq!(store.cleanup_expired(), 0);
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let store = CheckpointStore::new(
            Arc::new(MemoryCheckpointBackend::new()),
            CheckpointConfig { retention_ms: 1_000 },
        );
        let job = JobId::from("job-1");
        let old = store.create(&job, CheckpointType::FileUploaded, json!({}), "old");
        let removed = store.cleanup_expired_at(old.created_at_ms + 500);
        assert_eq!(removed, 0);
        let removed = store.cleanup_expired_at(old.created_at_ms + 5_000);
        assert_eq!(removed, 1);
        assert!(store.list_for_job(&job).is_empty());
    }

    #[test]
    fn sled_backend_keeps_append_order_per_job() {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = CheckpointStore::sled(db, CheckpointConfig::default()).unwrap();
        let a = JobId::from("a");
        let b = JobId::from("b");
        store.create(&a, CheckpointType::FileUploaded, json!(1), "a1");
        store.create(&b, CheckpointType::FileUploaded, json!(2), "b1");
        store.create(&a, CheckpointType::ParsingStarted, json!(3), "a2");

        let list = store.list_for_job(&a);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].description, "a1");
        assert_eq!(list[1].description, "a2");
        assert_eq!(store.list_for_job(&b).len(), 1);
    }

    #[test]
    fn checkpoint_type_parses_kebab_and_snake() {
        assert_eq!(
            CheckpointType::parse("generation-completed"),
            Some(CheckpointType::GenerationCompleted)
        );
        assert_eq!(
            CheckpointType::parse("file_uploaded"),
            Some(CheckpointType::FileUploaded)
        );
        assert_eq!(CheckpointType::parse("nope"), None);
    }
}
