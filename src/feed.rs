//! Live job feeds and the hub that multiplexes them across listeners.

pub mod hub;
pub mod source;

pub use hub::{Listener, SubscribeConfig, Subscription, SubscriptionConfig, SubscriptionHub};
pub use source::{FeedEvent, FeedSender, FeedSubscription, JobFeed, MemoryJobFeed};
