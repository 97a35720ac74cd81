//! Subscription hub: one upstream feed per job, any number of listeners.
//!
//! Each job with at least one listener gets a driver task that owns the
//! upstream subscription, drops stale payloads, debounces per listener and
//! resubscribes after upstream errors. Listeners run on the driver task with
//! no hub lock held, so they may subscribe or unsubscribe from inside their
//! callback. Every delivery for a job happens on that job's driver, which is
//! what keeps each listener's view monotonic.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::feed::source::{FeedEvent, FeedSubscription, JobFeed};
use crate::job::Job;
use crate::recovery::instability::InstabilityMonitor;
use crate::types::{JobId, ListenerId};

pub type Listener = Arc<dyn Fn(&Job) + Send + Sync>;

/// Per-listener delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeConfig {
    pub enable_logging: bool,
    /// Trailing debounce window; zero delivers every payload immediately
    pub debounce: Duration,
    /// Resubscribe upstream after feed errors
    pub error_recovery: bool,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            enable_logging: false,
            debounce: Duration::from_millis(default_debounce_ms()),
            error_recovery: true,
        }
    }
}

/// Hub-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Debounce applied by [`SubscriptionHub::default_subscribe_config`]
    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,

    /// Upstream resubscribe attempts before giving up on a job
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            default_debounce_ms: default_debounce_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl SubscriptionConfig {
    /// Jittered exponential delay before resubscribe attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        Duration::from_millis((base as f64 * factor) as u64)
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    callback: Listener,
    config: SubscribeConfig,
}

struct Channel {
    /// Identifies the driver that owns this channel.
    generation: u64,
    listeners: Vec<ListenerEntry>,
    latest: Option<Job>,
    cancel: CancellationToken,
    prime_tx: mpsc::UnboundedSender<ListenerId>,
}

impl Channel {
    fn error_recovery(&self) -> bool {
        self.listeners.iter().any(|l| l.config.error_recovery)
    }
}

struct HubInner {
    feed: Arc<dyn JobFeed>,
    config: SubscriptionConfig,
    channels: Mutex<HashMap<JobId, Channel>>,
    monitor: Option<Arc<InstabilityMonitor>>,
    generations: AtomicU64,
}

/// Multiplexes live job feeds across listeners.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(feed: Arc<dyn JobFeed>, config: SubscriptionConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                feed,
                config,
                channels: Mutex::new(HashMap::new()),
                monitor: None,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Report internal feed errors to `monitor`. Must be set before the first
    /// subscribe.
    pub fn with_instability_monitor(feed: Arc<dyn JobFeed>, config: SubscriptionConfig, monitor: Arc<InstabilityMonitor>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                feed,
                config,
                channels: Mutex::new(HashMap::new()),
                monitor: Some(monitor),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn default_subscribe_config(&self) -> SubscribeConfig {
        SubscribeConfig {
            debounce: Duration::from_millis(self.inner.config.default_debounce_ms),
            ..SubscribeConfig::default()
        }
    }

    /// Register `callback` for live updates of `job_id`.
    ///
    /// The first listener for a job opens the upstream feed; a listener
    /// joining an active job first receives the latest payload. Must be called
    /// from within a tokio runtime.
    pub fn subscribe<F>(&self, job_id: &JobId, callback: F, config: SubscribeConfig) -> Subscription
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let listener_id = ListenerId::next();
        let entry = ListenerEntry {
            id: listener_id,
            callback: Arc::new(callback),
            config,
        };

        let mut channels = self.inner.channels.lock();
        match channels.get_mut(job_id) {
            Some(channel) => {
                channel.listeners.push(entry);
                let _ = channel.prime_tx.send(listener_id);
                debug!(
                    job_id = %job_id,
                    listener = listener_id.as_u64(),
                    listeners = channel.listeners.len(),
                    "listener joined active feed"
                );
            }
            None => {
                let cancel = CancellationToken::new();
                let (prime_tx, prime_rx) = mpsc::unbounded_channel();
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                channels.insert(
                    job_id.clone(),
                    Channel {
                        generation,
                        listeners: vec![entry],
                        latest: None,
                        cancel: cancel.clone(),
                        prime_tx,
                    },
                );
                info!(job_id = %job_id, "opening job feed");
                let driver = Driver::new(
                    Arc::clone(&self.inner),
                    job_id.clone(),
                    generation,
                    cancel,
                    prime_rx,
                );
                tokio::spawn(driver.run());
            }
        }
        drop(channels);

        Subscription {
            hub: Arc::downgrade(&self.inner),
            job_id: job_id.clone(),
            listener_id,
            active: AtomicBool::new(true),
        }
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.inner.channels.lock().keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn listener_count(&self, job_id: &JobId) -> usize {
        self.inner
            .channels
            .lock()
            .get(job_id)
            .map(|c| c.listeners.len())
            .unwrap_or(0)
    }

    /// Latest payload accepted for `job_id`, if its feed is open.
    pub fn latest(&self, job_id: &JobId) -> Option<Job> {
        self.inner
            .channels
            .lock()
            .get(job_id)
            .and_then(|c| c.latest.clone())
    }
}

impl HubInner {
    fn remove_listener(&self, job_id: &JobId, listener_id: ListenerId) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(job_id) else {
            return;
        };
        channel.listeners.retain(|l| l.id != listener_id);
        if channel.listeners.is_empty() {
            if let Some(channel) = channels.remove(job_id) {
                channel.cancel.cancel();
                info!(job_id = %job_id, "last listener left, closing job feed");
            }
        }
    }
}

/// Handle returned by [`SubscriptionHub::subscribe`]. Dropping it
/// unsubscribes.
pub struct Subscription {
    hub: Weak<HubInner>,
    job_id: JobId,
    listener_id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    /// Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(&self.job_id, self.listener_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct PendingDelivery {
    job: Job,
    deadline: Instant,
}

struct Driver {
    hub: Arc<HubInner>,
    job_id: JobId,
    generation: u64,
    cancel: CancellationToken,
    prime_rx: mpsc::UnboundedReceiver<ListenerId>,
    upstream: Option<Box<dyn FeedSubscription>>,
    events: Option<mpsc::UnboundedReceiver<FeedEvent>>,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
    last_seen: Option<u64>,
    pending: HashMap<ListenerId, PendingDelivery>,
}

impl Driver {
    fn new(
        hub: Arc<HubInner>,
        job_id: JobId,
        generation: u64,
        cancel: CancellationToken,
        prime_rx: mpsc::UnboundedReceiver<ListenerId>,
    ) -> Self {
        Self {
            hub,
            job_id,
            generation,
            cancel,
            prime_rx,
            upstream: None,
            events: None,
            reconnect_at: Some(Instant::now()),
            reconnect_attempts: 0,
            last_seen: None,
            pending: HashMap::new(),
        }
    }

    async fn run(mut self) {
        loop {
            if self.upstream.is_none()
                && self.reconnect_at.map(|t| t <= Instant::now()).unwrap_or(false)
            {
                self.open_upstream().await;
            }

            let next_flush = self.pending.values().map(|p| p.deadline).min();
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(listener) = self.prime_rx.recv() => self.prime(listener),
                event = next_event(&mut self.events) => match event {
                    Some(FeedEvent::Update(job)) => self.on_update(job),
                    Some(FeedEvent::Error(err)) => self.on_error(err).await,
                    None => self.on_error(FeedError::Disconnected("feed channel closed".into())).await,
                },
                _ = sleep_until_opt(next_flush) => self.flush_due(),
                _ = sleep_until_opt(reconnect_at) => {}
            }
        }

        if let Some(mut upstream) = self.upstream.take() {
            upstream.unsubscribe();
        }
        debug!(job_id = %self.job_id, "job feed driver stopped");
    }

    async fn open_upstream(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.hub.feed.subscribe(&self.job_id, tx) {
            Ok(subscription) => {
                if self.reconnect_attempts > 0 {
                    info!(
                        job_id = %self.job_id,
                        attempt = self.reconnect_attempts,
                        "job feed resubscribed"
                    );
                }
                self.upstream = Some(subscription);
                self.events = Some(rx);
                self.reconnect_at = None;
            }
            Err(err) => self.on_error(err).await,
        }
    }

    /// Run `f` on this driver's channel. A replacement channel opened after
    /// this driver was cancelled belongs to another driver and is left alone.
    fn with_channel<R>(&self, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut channels = self.hub.channels.lock();
        channels
            .get_mut(&self.job_id)
            .filter(|channel| channel.generation == self.generation)
            .map(f)
    }

    fn listener(&self, listener_id: ListenerId) -> Option<ListenerEntry> {
        self.with_channel(|channel| {
            channel
                .listeners
                .iter()
                .find(|l| l.id == listener_id)
                .cloned()
        })
        .flatten()
    }

    fn on_update(&mut self, job: Job) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(seen) = self.last_seen {
            if job.updated_at_ms < seen {
                debug!(
                    job_id = %self.job_id,
                    payload_updated_at = job.updated_at_ms,
                    last_seen = seen,
                    "dropping stale payload"
                );
                return;
            }
        }
        self.last_seen = Some(job.updated_at_ms);
        self.reconnect_attempts = 0;

        let Some(listeners) = self.with_channel(|channel| {
            channel.latest = Some(job.clone());
            channel.listeners.clone()
        }) else {
            return;
        };

        let now = Instant::now();
        let mut immediate = Vec::new();
        for listener in listeners {
            if listener.config.debounce.is_zero() {
                immediate.push(listener);
            } else {
                self.pending.insert(
                    listener.id,
                    PendingDelivery {
                        job: job.clone(),
                        deadline: now + listener.config.debounce,
                    },
                );
            }
        }
        for listener in immediate {
            // Earlier callbacks may have unsubscribed it or closed the channel.
            if let Some(current) = self.listener(listener.id) {
                self.deliver(&current, &job);
            }
        }
    }

    fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<ListenerId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() {
            return;
        }
        for id in due {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            if let Some(listener) = self.listener(id) {
                self.deliver(&listener, &pending.job);
            }
        }
    }

    fn prime(&mut self, listener_id: ListenerId) {
        let Some((listener, latest)) = self.with_channel(|channel| {
            (
                channel.listeners.iter().find(|l| l.id == listener_id).cloned(),
                channel.latest.clone(),
            )
        }) else {
            return;
        };
        if let (Some(listener), Some(job)) = (listener, latest) {
            self.pending.remove(&listener_id);
            self.deliver(&listener, &job);
        }
    }

    async fn on_error(&mut self, err: FeedError) {
        warn!(job_id = %self.job_id, error = %err, "job feed error");
        if let Some(mut upstream) = self.upstream.take() {
            upstream.unsubscribe();
        }
        self.events = None;

        if let Some(monitor) = &self.hub.monitor {
            monitor.report(&err).await;
        }

        let recover = self
            .with_channel(|channel| channel.error_recovery())
            .unwrap_or(false);
        if !recover {
            error!(job_id = %self.job_id, "job feed lost and error recovery is disabled");
            self.reconnect_at = None;
            return;
        }

        self.reconnect_attempts += 1;
        let max = self.hub.config.max_reconnect_attempts;
        if self.reconnect_attempts > max {
            error!(
                job_id = %self.job_id,
                attempts = max,
                "giving up on job feed after repeated failures"
            );
            self.reconnect_at = None;
            return;
        }
        let delay = self.hub.config.reconnect_delay(self.reconnect_attempts);
        debug!(
            job_id = %self.job_id,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling job feed resubscribe"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn deliver(&self, listener: &ListenerEntry, job: &Job) {
        if listener.config.enable_logging {
            info!(
                job_id = %self.job_id,
                listener = listener.id.as_u64(),
                status = job.status.as_str(),
                progress = job.progress(),
                "delivering job update"
            );
        }
        let callback = Arc::clone(&listener.callback);
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(job))).is_err() {
            error!(
                job_id = %self.job_id,
                listener = listener.id.as_u64(),
                "listener panicked while handling job update"
            );
        }
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<FeedEvent>>) -> Option<FeedEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
