//! End-to-end folding of a live job feed into progress and preview.

use std::sync::Arc;
use std::time::Duration;

use vitae::feed::{MemoryJobFeed, SubscribeConfig, SubscriptionConfig, SubscriptionHub};
use vitae::job::{FeatureRecord, Job, JobStatus};
use vitae::pipeline::JobPipeline;
use vitae::preview::PreviewConfig;
use vitae::progress::CompletionOutcome;
use vitae::recovery::{CheckpointStore, CheckpointType};
use vitae::types::JobId;

const BASE: &str = "<html><head><title>cv</title></head><body><h1>Jane Doe</h1></body></html>";

fn immediate() -> SubscribeConfig {
    SubscribeConfig {
        debounce: Duration::ZERO,
        ..SubscribeConfig::default()
    }
}

fn ordered(ids: &[&str]) -> PreviewConfig {
    PreviewConfig {
        feature_order: ids.iter().map(|s| s.to_string()).collect(),
        sandbox: true,
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn fragments_land_in_configured_order_regardless_of_completion_order() {
    let feed = MemoryJobFeed::new();
    let job_id = JobId::from("cv-42");
    feed.publish(Job::new(
        job_id.clone(),
        BASE,
        vec!["skills-viz".into(), "podcast".into()],
    ));
    let hub = SubscriptionHub::new(Arc::new(feed.clone()), SubscriptionConfig::default());
    let checkpoints = CheckpointStore::in_memory();
    let pipeline = JobPipeline::start(
        &hub,
        checkpoints.clone(),
        job_id.clone(),
        &ordered(&["podcast", "skills-viz"]),
        immediate(),
        None,
    );
    settle().await;

    feed.update(&job_id, |job| {
        job.status = JobStatus::Generating;
        job.features.insert(
            "skills-viz".into(),
            FeatureRecord::completed("<svg id=\"skills\"></svg>"),
        );
        job.features
            .insert("podcast".into(), FeatureRecord::processing(40));
    });
    settle().await;
    {
        let preview = pipeline.preview().borrow().clone();
        assert!(preview.html.contains("id=\"skills\""));
        assert!(!preview.html.contains("data-feature=\"podcast\""));
    }

    feed.update(&job_id, |job| {
        job.status = JobStatus::Completed;
        job.features.insert(
            "podcast".into(),
            FeatureRecord::completed("<audio src=\"cv.mp3\" onplay=\"track()\"></audio>"),
        );
    });
    let state = pipeline.finished().await.unwrap();
    assert_eq!(state.outcome(), CompletionOutcome::Full);
    assert_eq!(state.completion_rate, 1.0);

    let html = pipeline.preview().borrow().html.clone();
    let podcast = html.find("data-feature=\"podcast\"").unwrap();
    let skills = html.find("data-feature=\"skills-viz\"").unwrap();
    assert!(podcast < skills, "podcast must precede skills-viz:\n{html}");
    assert!(!html.contains("onplay"));
    assert!(html.contains("Content-Security-Policy"));

    let feature_checkpoints = checkpoints
        .list_for_job(&job_id)
        .into_iter()
        .filter(|c| c.checkpoint_type == CheckpointType::FeatureCompleted)
        .count();
    assert_eq!(feature_checkpoints, 2);
    assert!(checkpoints
        .latest(&job_id, CheckpointType::GenerationCompleted)
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_feature_yields_partial_outcome() {
    let feed = MemoryJobFeed::new();
    let job_id = JobId::from("cv-43");
    feed.publish(Job::new(
        job_id.clone(),
        BASE,
        vec!["video".into(), "timeline".into()],
    ));
    let hub = SubscriptionHub::new(Arc::new(feed.clone()), SubscriptionConfig::default());
    let pipeline = JobPipeline::start(
        &hub,
        CheckpointStore::in_memory(),
        job_id.clone(),
        &PreviewConfig::default(),
        immediate(),
        None,
    );
    settle().await;

    feed.update(&job_id, |job| {
        job.features
            .insert("timeline".into(), FeatureRecord::completed("<ol></ol>"));
        job.features.insert(
            "video".into(),
            FeatureRecord::failed("render farm rejected the script", false, 2),
        );
    });
    let state = pipeline.finished().await.unwrap();
    assert_eq!(
        state.outcome(),
        CompletionOutcome::Partial { failed: 1 }
    );
    let preview = pipeline.preview().borrow().clone();
    assert_eq!(preview.applied_feature_ids.len(), 1);
    assert!(preview.applied_feature_ids.contains(&"timeline".into()));
}
