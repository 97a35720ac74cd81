//! Folds raw job payloads into per-feature progress and aggregate counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::job::{FeatureRecord, FeatureStatus, Job, JobStatus};
use crate::progress::state::{check_transition, Transition};
use crate::types::{FeatureId, JobId};

/// Callbacks fired by [`ProgressAggregator::apply`]. Both fire at most once
/// per feature / per aggregator, however often the feed re-delivers.
pub trait ProgressObserver: Send + Sync {
    fn on_feature_complete(&self, _feature_id: &FeatureId, _record: &FeatureRecord) {}

    fn on_all_features_complete(&self, _state: &ProgressState) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeatureCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub processing: usize,
    pub retrying: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    InProgress,
    /// Every feature completed.
    Full,
    /// Everything is terminal and some features failed.
    Partial { failed: usize },
    /// Everything is terminal and nothing completed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressState {
    pub job_id: JobId,
    /// Tracked features in request order.
    pub tracked: Vec<FeatureId>,
    pub features: BTreeMap<FeatureId, FeatureRecord>,
    pub counts: FeatureCounts,
    pub completion_rate: f64,
    pub is_processing: bool,
}

impl ProgressState {
    fn empty(job_id: JobId) -> Self {
        Self {
            job_id,
            tracked: Vec::new(),
            features: BTreeMap::new(),
            counts: FeatureCounts::default(),
            completion_rate: 0.0,
            is_processing: false,
        }
    }

    pub fn feature(&self, feature_id: &FeatureId) -> Option<&FeatureRecord> {
        self.features.get(feature_id)
    }

    /// Completed features that carry a fragment, in request order.
    pub fn completed_fragments(&self) -> Vec<(&FeatureId, &str)> {
        self.tracked
            .iter()
            .filter_map(|id| {
                let record = self.features.get(id)?;
                match (record.status, record.html_fragment.as_deref()) {
                    (FeatureStatus::Completed, Some(fragment)) => Some((id, fragment)),
                    _ => None,
                }
            })
            .collect()
    }

    /// True once nothing is left to wait for. A job tracking no features is
    /// vacuously complete.
    pub fn all_terminal(&self) -> bool {
        self.counts.processing == 0 && self.features.values().all(|r| r.is_terminal())
    }

    pub fn outcome(&self) -> CompletionOutcome {
        if !self.all_terminal() {
            return CompletionOutcome::InProgress;
        }
        match (self.counts.completed, self.counts.failed) {
            (_, 0) => CompletionOutcome::Full,
            (0, _) => CompletionOutcome::Failed,
            (_, failed) => CompletionOutcome::Partial { failed },
        }
    }
}

/// Coarse stage/percentage view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub percentage: u8,
    pub stage: String,
    pub error: Option<String>,
}

impl JobProgress {
    pub fn from_job(job: &Job) -> Self {
        let percentage = if job.status == JobStatus::Completed {
            100
        } else {
            job.progress()
        };
        Self {
            status: job.status,
            percentage,
            stage: job.current_stage.clone(),
            error: job.error.clone(),
        }
    }
}

/// Stateful aggregator bound to one job.
pub struct ProgressAggregator {
    job_id: Option<JobId>,
    records: HashMap<FeatureId, FeatureRecord>,
    notified: HashSet<FeatureId>,
    all_complete_fired: bool,
    last_state: Option<ProgressState>,
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self {
            job_id: None,
            records: HashMap::new(),
            notified: HashSet::new(),
            all_complete_fired: false,
            last_state: None,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> Option<&ProgressState> {
        self.last_state.as_ref()
    }

    pub fn all_complete_fired(&self) -> bool {
        self.all_complete_fired
    }

    /// Fold `job` into the per-feature view and fire observer callbacks.
    pub fn apply(&mut self, job: &Job) -> ProgressState {
        let bound = self
            .job_id
            .get_or_insert_with(|| job.job_id.clone())
            .clone();
        if bound != job.job_id {
            warn!(
                bound = %bound,
                received = %job.job_id,
                "ignoring payload for a different job"
            );
            return self
                .last_state
                .clone()
                .unwrap_or_else(|| ProgressState::empty(bound));
        }

        let tracked = tracked_features(job);
        let mut newly_completed = Vec::new();

        for feature_id in &tracked {
            let incoming = job.feature(feature_id);
            let previous = self.records.get(feature_id);
            match check_transition(previous, &incoming) {
                Transition::Rejected(reason) => {
                    warn!(
                        job_id = %job.job_id,
                        feature = %feature_id,
                        from = previous.map(|r| r.status.as_str()).unwrap_or("none"),
                        to = incoming.status.as_str(),
                        reason = reason.as_str(),
                        "ignoring illegal feature transition"
                    );
                    continue;
                }
                Transition::Advanced => {
                    debug!(
                        job_id = %job.job_id,
                        feature = %feature_id,
                        to = incoming.status.as_str(),
                        "feature advanced"
                    );
                }
                Transition::Initial | Transition::Unchanged => {}
            }
            if incoming.status == FeatureStatus::Completed && incoming.html_fragment.is_none() {
                warn!(job_id = %job.job_id, feature = %feature_id, "completed feature without fragment");
            }
            if incoming.status == FeatureStatus::Completed && self.notified.insert(feature_id.clone()) {
                newly_completed.push((feature_id.clone(), incoming.clone()));
            }
            self.records.insert(feature_id.clone(), incoming);
        }

        let state = self.build_state(job.job_id.clone(), tracked);

        for (feature_id, record) in &newly_completed {
            info!(job_id = %job.job_id, feature = %feature_id, "feature completed");
            for observer in &self.observers {
                observer.on_feature_complete(feature_id, record);
            }
        }
        if !self.all_complete_fired && state.all_terminal() {
            self.all_complete_fired = true;
            info!(
                job_id = %job.job_id,
                completed = state.counts.completed,
                failed = state.counts.failed,
                "all features finished"
            );
            for observer in &self.observers {
                observer.on_all_features_complete(&state);
            }
        }

        self.last_state = Some(state.clone());
        state
    }

    fn build_state(&self, job_id: JobId, tracked: Vec<FeatureId>) -> ProgressState {
        let mut features = BTreeMap::new();
        let mut counts = FeatureCounts::default();
        for feature_id in &tracked {
            let record = self
                .records
                .get(feature_id)
                .cloned()
                .unwrap_or_else(FeatureRecord::pending);
            counts.total += 1;
            match record.status {
                FeatureStatus::Completed => counts.completed += 1,
                FeatureStatus::Failed => counts.failed += 1,
                FeatureStatus::Processing => counts.processing += 1,
                FeatureStatus::Retrying => counts.retrying += 1,
                FeatureStatus::Pending => counts.pending += 1,
            }
            features.insert(feature_id.clone(), record);
        }
        let completion_rate = if counts.total == 0 {
            1.0
        } else {
            counts.completed as f64 / counts.total as f64
        };
        let is_processing =
            counts.completed < counts.total && features.values().any(|r| !r.is_terminal());
        ProgressState {
            job_id,
            tracked,
            features,
            counts,
            completion_rate,
            is_processing,
        }
    }
}

/// Selected features first, then any extra features the backend reported.
fn tracked_features(job: &Job) -> Vec<FeatureId> {
    let mut tracked = job.tracked_features();
    let mut extra: Vec<FeatureId> = job
        .features
        .keys()
        .filter(|id| !tracked.contains(id))
        .cloned()
        .collect();
    extra.sort();
    tracked.extend(extra);
    tracked
}
