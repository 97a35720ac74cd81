//! Per-job client pipeline: hub subscription → progress aggregator → preview
//! merger, republished as watch channels for any number of readers.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::feed::{SubscribeConfig, SubscriptionHub};
use crate::job::{FeatureRecord, Job};
use crate::preview::{MergedPreview, PreviewConfig, PreviewMerger};
use crate::progress::{JobProgress, ProgressAggregator, ProgressObserver, ProgressState};
use crate::recovery::checkpoint::{CheckpointStore, CheckpointType};
use crate::types::{FeatureId, JobId};

/// Writes a checkpoint for every completed feature and one when the whole
/// job has finished.
struct CheckpointObserver {
    store: CheckpointStore,
    job_id: JobId,
}

impl ProgressObserver for CheckpointObserver {
    fn on_feature_complete(&self, feature_id: &FeatureId, record: &FeatureRecord) {
        self.store.create(
            &self.job_id,
            CheckpointType::FeatureCompleted,
            json!({
                "feature": feature_id.as_str(),
                "duration_ms": record.duration_ms(),
                "fragment_bytes": record.html_fragment.as_ref().map(|f| f.len()),
            }),
            format!("feature {feature_id} completed"),
        );
    }

    fn on_all_features_complete(&self, state: &ProgressState) {
        self.store.create(
            &self.job_id,
            CheckpointType::GenerationCompleted,
            json!({
                "completed": state.counts.completed,
                "failed": state.counts.failed,
                "total": state.counts.total,
            }),
            "all features finished",
        );
    }
}

struct PipelineState {
    aggregator: ProgressAggregator,
    merger: PreviewMerger,
    base_seen: bool,
}

struct Publishers {
    progress: watch::Sender<Option<ProgressState>>,
    job_progress: watch::Sender<Option<JobProgress>>,
    preview: watch::Sender<MergedPreview>,
}

/// Live read models for one job. Cancelling (or dropping) the pipeline
/// releases its hub subscription.
pub struct JobPipeline {
    job_id: JobId,
    cancel: CancellationToken,
    progress: watch::Receiver<Option<ProgressState>>,
    job_progress: watch::Receiver<Option<JobProgress>>,
    preview: watch::Receiver<MergedPreview>,
}

impl JobPipeline {
    /// Subscribe to `job_id` and start folding payloads. Must be called from
    /// within a tokio runtime.
    pub fn start(
        hub: &SubscriptionHub,
        checkpoints: CheckpointStore,
        job_id: JobId,
        preview_config: &PreviewConfig,
        subscribe_config: SubscribeConfig,
        parent: Option<&CancellationToken>,
    ) -> Self {
        let cancel = parent
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        let aggregator = ProgressAggregator::new().with_observer(Arc::new(CheckpointObserver {
            store: checkpoints,
            job_id: job_id.clone(),
        }));
        let merger = PreviewMerger::from_config(String::new(), preview_config);

        let (progress_tx, progress) = watch::channel(None);
        let (job_progress_tx, job_progress) = watch::channel(None);
        let (preview_tx, preview) = watch::channel(merger.preview().clone());

        let state = Mutex::new(PipelineState {
            aggregator,
            merger,
            base_seen: false,
        });
        let publishers = Publishers {
            progress: progress_tx,
            job_progress: job_progress_tx,
            preview: preview_tx,
        };

        let token = cancel.clone();
        let subscription = hub.subscribe(
            &job_id,
            move |job: &Job| {
                if token.is_cancelled() {
                    return;
                }
                fold(&mut state.lock(), &publishers, job);
            },
            subscribe_config,
        );

        let token = cancel.clone();
        let task_job = job_id.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            subscription.unsubscribe();
            debug!(job_id = %task_job, "pipeline subscription released");
        });

        info!(job_id = %job_id, "job pipeline started");
        Self {
            job_id,
            cancel,
            progress,
            job_progress,
            preview,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn progress(&self) -> watch::Receiver<Option<ProgressState>> {
        self.progress.clone()
    }

    pub fn job_progress(&self) -> watch::Receiver<Option<JobProgress>> {
        self.job_progress.clone()
    }

    pub fn preview(&self) -> watch::Receiver<MergedPreview> {
        self.preview.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until every tracked feature is terminal. Returns `None` if the
    /// pipeline is cancelled first.
    pub async fn finished(&self) -> Option<ProgressState> {
        let mut rx = self.progress.clone();
        loop {
            if let Some(state) = rx.borrow_and_update().as_ref() {
                if state.all_terminal() {
                    return Some(state.clone());
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Drop for JobPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn fold(state: &mut PipelineState, publishers: &Publishers, job: &Job) {
    if !state.base_seen || state.merger.preview().base_document != job.base_document {
        state.merger.reset_base(job.base_document.clone());
        state.base_seen = true;
    }

    let progress = state.aggregator.apply(job);
    state.merger.apply_completed(&progress);

    let merged = state.merger.preview().clone();
    publishers.preview.send_if_modified(|current| {
        if *current == merged {
            false
        } else {
            *current = merged;
            true
        }
    });
    publishers.progress.send_replace(Some(progress));
    publishers
        .job_progress
        .send_replace(Some(JobProgress::from_job(job)));
}
