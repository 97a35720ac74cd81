//! Upstream job feed: the backing store's push subscription primitive.
//!
//! A feed delivers full [`Job`] projections (never diffs) for one job into a
//! channel until it is unsubscribed or fails. After delivering an error the
//! upstream subscription is considered dead; resubscribing is the caller's
//! job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FeedError;
use crate::job::Job;
use crate::types::JobId;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Update(Job),
    Error(FeedError),
}

pub type FeedSender = mpsc::UnboundedSender<FeedEvent>;

/// Live upstream subscription. `unsubscribe` must be idempotent.
pub trait FeedSubscription: Send {
    fn unsubscribe(&mut self);
}

pub trait JobFeed: Send + Sync {
    fn subscribe(
        &self,
        job_id: &JobId,
        sink: FeedSender,
    ) -> Result<Box<dyn FeedSubscription>, FeedError>;
}

#[derive(Default)]
struct MemoryFeedInner {
    jobs: HashMap<JobId, Job>,
    subscribers: HashMap<JobId, Vec<(u64, FeedSender)>>,
    next_subscriber: u64,
    opened: HashMap<JobId, usize>,
    reject_next: usize,
}

/// In-process backing store used by tests and the offline simulator.
///
/// New subscribers immediately receive the current projection, mirroring a
/// snapshot listener.
#[derive(Clone, Default)]
pub struct MemoryJobFeed {
    inner: Arc<Mutex<MemoryFeedInner>>,
}

impl MemoryJobFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `job` as-is and push it to current subscribers.
    pub fn publish(&self, job: Job) {
        let mut inner = self.inner.lock();
        let job_id = job.job_id.clone();
        inner.jobs.insert(job_id.clone(), job.clone());
        if let Some(subs) = inner.subscribers.get_mut(&job_id) {
            subs.retain(|(_, tx)| tx.send(FeedEvent::Update(job.clone())).is_ok());
        }
    }

    /// Mutate the stored job, bump its recency stamp and publish it.
    pub fn update<F>(&self, job_id: &JobId, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self.inner.lock().jobs.get(job_id).cloned()?;
        mutate(&mut job);
        job.updated_at_ms += 1;
        self.publish(job.clone());
        Some(job)
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// Deliver `error` to every subscriber of `job_id` and drop them.
    pub fn fail(&self, job_id: &JobId, error: FeedError) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.remove(job_id) {
            for (_, tx) in subs {
                let _ = tx.send(FeedEvent::Error(error.clone()));
            }
        }
    }

    /// Reject the next `count` subscribe calls.
    pub fn reject_next_subscribes(&self, count: usize) {
        self.inner.lock().reject_next = count;
    }

    /// Upstream subscriptions ever opened for `job_id`.
    pub fn opened_count(&self, job_id: &JobId) -> usize {
        self.inner.lock().opened.get(job_id).copied().unwrap_or(0)
    }

    /// Upstream subscriptions currently open for `job_id`.
    pub fn active_count(&self, job_id: &JobId) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(job_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl JobFeed for MemoryJobFeed {
    fn subscribe(
        &self,
        job_id: &JobId,
        sink: FeedSender,
    ) -> Result<Box<dyn FeedSubscription>, FeedError> {
        let mut inner = self.inner.lock();
        if inner.reject_next > 0 {
            inner.reject_next -= 1;
            return Err(FeedError::Rejected(format!("subscribe to {job_id} refused")));
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        *inner.opened.entry(job_id.clone()).or_insert(0) += 1;
        if let Some(job) = inner.jobs.get(job_id) {
            let _ = sink.send(FeedEvent::Update(job.clone()));
        }
        inner
            .subscribers
            .entry(job_id.clone())
            .or_default()
            .push((id, sink));
        debug!(job_id = %job_id, subscriber = id, "memory feed subscription opened");
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            job_id: job_id.clone(),
            id,
            active: true,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Mutex<MemoryFeedInner>>,
    job_id: JobId,
    id: u64,
    active: bool,
}

impl FeedSubscription for MemorySubscription {
    fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(&self.job_id) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                inner.subscribers.remove(&self.job_id);
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_gets_snapshot_then_updates() {
        let feed = MemoryJobFeed::new();
        let job_id = JobId::from("j1");
        feed.publish(Job::new(job_id.clone(), "<body></body>", vec![]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = feed.subscribe(&job_id, tx).unwrap();
        feed.update(&job_id, |job| job.current_progress = 50);

        match rx.recv().await.unwrap() {
            FeedEvent::Update(job) => assert_eq!(job.current_progress, 0),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await.unwrap() {
            FeedEvent::Update(job) => {
                assert_eq!(job.current_progress, 50);
                assert_eq!(job.updated_at_ms, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(feed.active_count(&job_id), 0);
        assert_eq!(feed.opened_count(&job_id), 1);
    }

    #[tokio::test]
    async fn failure_drops_subscribers() {
        let feed = MemoryJobFeed::new();
        let job_id = JobId::from("j1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = feed.subscribe(&job_id, tx).unwrap();
        feed.fail(&job_id, FeedError::Disconnected("gone".into()));
        assert!(matches!(rx.recv().await, Some(FeedEvent::Error(_))));
        assert_eq!(feed.active_count(&job_id), 0);
    }

    #[test]
    fn rejected_subscribe_returns_error() {
        let feed = MemoryJobFeed::new();
        feed.reject_next_subscribes(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(feed.subscribe(&JobId::from("j"), tx.clone()).is_err());
        assert!(feed.subscribe(&JobId::from("j"), tx).is_ok());
    }
}
