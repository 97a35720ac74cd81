//! Shared identifiers and time helpers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static LISTENER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque job identifier assigned by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Enhancement feature identifier, e.g. `podcast` or `skills-viz`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a hub listener, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn next() -> Self {
        ListenerId(LISTENER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Key prefix owned by exactly one job: big-endian id length, then the id.
///
/// A plain `"{job_id}:"` prefix would also match ids that extend it.
pub fn job_key_prefix(job_id: &JobId) -> Vec<u8> {
    let id = job_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

/// Job prefix followed by a big-endian sequence number, so keys of one job
/// sort by sequence.
pub fn job_seq_key(job_id: &JobId, seq: u64) -> Vec<u8> {
    let mut key = job_key_prefix(job_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Generate a unique checkpoint id.
pub fn new_checkpoint_id() -> String {
    format!("ckpt-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_prefixes_do_not_nest() {
        let short = job_key_prefix(&JobId::from("acme"));
        let long = job_seq_key(&JobId::from("acme:retry"), 1);
        assert!(!long.starts_with(&short));
        assert!(job_seq_key(&JobId::from("acme"), 7).starts_with(&short));
    }

    #[test]
    fn seq_keys_sort_numerically() {
        let job = JobId::from("j");
        assert!(job_seq_key(&job, 2) < job_seq_key(&job, 10));
    }

    #[test]
    fn checkpoint_ids_are_unique() {
        let a = new_checkpoint_id();
        let b = new_checkpoint_id();
        assert_ne!(a, b);
        assert!(a.starts_with("ckpt-"));
    }

    #[test]
    fn listener_ids_increase() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = FeatureId::from("podcast");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"podcast\"");
    }
}
