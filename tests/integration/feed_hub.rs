//! Hub multiplexing and recovery from feed failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use vitae::error::FeedError;
use vitae::feed::{MemoryJobFeed, SubscribeConfig, SubscriptionConfig, SubscriptionHub};
use vitae::job::Job;
use vitae::recovery::{InfrastructureReset, InstabilityConfig, InstabilityMonitor};
use vitae::types::JobId;

fn job(id: &str, stamp: u64) -> Job {
    let mut job = Job::new(JobId::from(id), "<body></body>", vec!["podcast".into()]);
    job.updated_at_ms = stamp;
    job.current_progress = (stamp.min(100)) as u8;
    job
}

fn immediate() -> SubscribeConfig {
    SubscribeConfig {
        debounce: Duration::ZERO,
        ..SubscribeConfig::default()
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct CountingReset {
    cleared: AtomicUsize,
}

#[async_trait]
impl InfrastructureReset for CountingReset {
    async fn disable_network(&self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn clear_local_cache(&self) -> Result<(), FeedError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_network(&self) -> Result<(), FeedError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_are_multiplexed_independently() {
    let feed = MemoryJobFeed::new();
    let hub = SubscriptionHub::new(Arc::new(feed.clone()), SubscriptionConfig::default());
    let a = JobId::from("a");
    let b = JobId::from("b");

    let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let listen = |seen: Arc<Mutex<Vec<(String, u64)>>>| {
        move |job: &Job| seen.lock().push((job.job_id.to_string(), job.updated_at_ms))
    };
    let sub_a1 = hub.subscribe(&a, listen(seen.clone()), immediate());
    let _sub_a2 = hub.subscribe(&a, listen(seen.clone()), immediate());
    let _sub_b = hub.subscribe(&b, listen(seen.clone()), immediate());
    settle().await;

    assert_eq!(hub.active_jobs(), vec![a.clone(), b.clone()]);
    assert_eq!(feed.active_count(&a), 1);
    assert_eq!(feed.active_count(&b), 1);

    feed.publish(job("a", 1));
    feed.publish(job("b", 2));
    settle().await;
    {
        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|(id, _)| id == "a").count(), 2);
        assert_eq!(seen.iter().filter(|(id, _)| id == "b").count(), 1);
    }

    sub_a1.unsubscribe();
    settle().await;
    assert_eq!(hub.listener_count(&a), 1);
    assert_eq!(feed.active_count(&a), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_internal_errors_trigger_one_reset_and_delivery_resumes() {
    let feed = MemoryJobFeed::new();
    let reset = Arc::new(CountingReset::default());
    let monitor = Arc::new(InstabilityMonitor::new(
        InstabilityConfig {
            threshold: 2,
            window_ms: 600_000,
            stabilization_ms: 100,
        },
        reset.clone(),
    ));
    let config = SubscriptionConfig {
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 200,
        ..SubscriptionConfig::default()
    };
    let hub = SubscriptionHub::with_instability_monitor(Arc::new(feed.clone()), config, monitor.clone());
    let job_id = JobId::from("flaky");
    feed.publish(job("flaky", 1));

    let stamps: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = stamps.clone();
    let _sub = hub.subscribe(
        &job_id,
        move |job: &Job| sink.lock().push(job.updated_at_ms),
        immediate(),
    );
    settle().await;

    for _ in 0..2 {
        feed.fail(&job_id, FeedError::Internal("ID: ca9".into()));
        for _ in 0..5 {
            settle().await;
            tokio::time::advance(Duration::from_millis(250)).await;
        }
    }
    settle().await;

    assert_eq!(monitor.resets(), 1);
    assert_eq!(reset.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(feed.active_count(&job_id), 1);

    feed.publish(job("flaky", 9));
    settle().await;
    assert_eq!(stamps.lock().last(), Some(&9));
}
