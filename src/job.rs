//! Job projection as delivered by the backing store.
//!
//! The backend owns jobs and mutates them; the client only reads the latest
//! projection pushed through the feed. Every payload is a full snapshot, not a
//! diff.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{FeatureId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Analyzed,
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Analyzed => "analyzed",
            JobStatus::Generating => "generating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl FeatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::Processing => "processing",
            FeatureStatus::Completed => "completed",
            FeatureStatus::Failed => "failed",
            FeatureStatus::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureError {
    pub message: String,
    #[serde(default)]
    pub is_retryable: bool,
    #[serde(default)]
    pub retry_count: u32,
}

/// One row of a job's feature map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub status: FeatureStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FeatureError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl FeatureRecord {
    /// Record for a feature the backend has not reported yet.
    pub fn pending() -> Self {
        Self {
            status: FeatureStatus::Pending,
            progress: 0,
            html_fragment: None,
            error: None,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    pub fn processing(progress: u8) -> Self {
        Self {
            status: FeatureStatus::Processing,
            progress: progress.min(100),
            ..Self::pending()
        }
    }

    pub fn completed(fragment: impl Into<String>) -> Self {
        Self {
            status: FeatureStatus::Completed,
            progress: 100,
            html_fragment: Some(fragment.into()),
            ..Self::pending()
        }
    }

    pub fn failed(message: impl Into<String>, is_retryable: bool, retry_count: u32) -> Self {
        Self {
            status: FeatureStatus::Failed,
            error: Some(FeatureError {
                message: message.into(),
                is_retryable,
                retry_count,
            }),
            ..Self::pending()
        }
    }

    /// Failed with no retry left; absorbing.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == FeatureStatus::Failed
            && !self.error.as_ref().map(|e| e.is_retryable).unwrap_or(false)
    }

    pub fn is_terminal(&self) -> bool {
        self.status == FeatureStatus::Completed || self.status == FeatureStatus::Failed
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Local projection of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub base_document: String,
    #[serde(default)]
    pub selected_features: Vec<FeatureId>,
    #[serde(default)]
    pub current_progress: u8,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub features: HashMap<FeatureId, FeatureRecord>,
    /// Backend recency stamp of this projection.
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Job {
    pub fn new(job_id: JobId, base_document: impl Into<String>, features: Vec<FeatureId>) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            base_document: base_document.into(),
            selected_features: features,
            current_progress: 0,
            current_stage: String::new(),
            error: None,
            features: HashMap::new(),
            updated_at_ms: 0,
        }
    }

    /// Selected features in request order with duplicates removed.
    pub fn tracked_features(&self) -> Vec<FeatureId> {
        let mut seen = std::collections::HashSet::new();
        self.selected_features
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Record for `feature`, defaulting to pending when the backend has not
    /// reported it.
    pub fn feature(&self, feature: &FeatureId) -> FeatureRecord {
        self.features
            .get(feature)
            .cloned()
            .unwrap_or_else(FeatureRecord::pending)
    }

    pub fn progress(&self) -> u8 {
        self.current_progress.min(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_feature_reads_as_pending() {
        let job = Job::new(JobId::from("j1"), "<html></html>", vec!["podcast".into()]);
        let record = job.feature(&FeatureId::from("podcast"));
        assert_eq!(record.status, FeatureStatus::Pending);
        assert_eq!(record.progress, 0);
    }

    #[test]
    fn tracked_features_dedupes_in_order() {
        let job = Job::new(
            JobId::from("j1"),
            "",
            vec!["b".into(), "a".into(), "b".into()],
        );
        let tracked = job.tracked_features();
        assert_eq!(tracked, vec![FeatureId::from("b"), FeatureId::from("a")]);
    }

    #[test]
    fn retryable_failure_is_not_absorbing() {
        assert!(!FeatureRecord::failed("boom", true, 1).is_terminal_failure());
        assert!(FeatureRecord::failed("boom", false, 3).is_terminal_failure());
    }

    #[test]
    fn payload_deserializes_with_defaults() {
        let raw = serde_json::json!({
            "job_id": "j9",
            "status": "generating",
            "features": {
                "podcast": { "status": "processing", "progress": 40 }
            }
        });
        let job: Job = serde_json::from_value(raw).unwrap();
        assert_eq!(job.status, JobStatus::Generating);
        assert_eq!(job.feature(&"podcast".into()).progress, 40);
        assert_eq!(job.updated_at_ms, 0);
    }
}
