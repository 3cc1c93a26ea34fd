//! Client-side rate limiting over named token buckets
//!
//! The limiter holds one bucket per traffic class. A class with no bucket
//! configured is unlimited, so an empty limiter is a no-op and the hot
//! path stays cheap.

use std::collections::HashMap;

use parking_lot::Mutex;
use sockmux_types::{AcquireOutcome, BucketConfig, TokenBucket};
use tracing::debug;

/// Named-bucket rate limiter shared by a client and its connections
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Traffic class consumed per transport open
    pub const CONNECTION: &'static str = "connection";
    /// Traffic class consumed per outbound request
    pub const MESSAGES: &'static str = "messages";

    /// An unlimited limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bucket for a traffic class
    pub fn with_bucket(mut self, class: impl Into<String>, config: BucketConfig) -> Self {
        self.buckets
            .insert(class.into(), Mutex::new(config.create_bucket()));
        self
    }

    /// True when no class is limited
    pub fn is_unlimited(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Try to take one token for `class` without waiting
    pub fn try_acquire(&self, class: &str) -> AcquireOutcome {
        match self.buckets.get(class) {
            Some(bucket) => match bucket.lock().try_acquire(1) {
                Ok(()) => AcquireOutcome::Allowed,
                Err(wait) => AcquireOutcome::Limited { wait },
            },
            None => AcquireOutcome::Allowed,
        }
    }

    /// Take one token for `class`, sleeping until one is available
    pub async fn acquire(&self, class: &str) {
        loop {
            match self.try_acquire(class) {
                AcquireOutcome::Allowed => return,
                AcquireOutcome::Limited { wait } => {
                    debug!(class, ?wait, "rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Whole tokens currently available for `class`
    pub fn available(&self, class: &str) -> u32 {
        self.buckets
            .get(class)
            .map(|bucket| bucket.lock().available())
            .unwrap_or(u32::MAX)
    }

    /// Refill every bucket to capacity
    pub fn reset(&self) {
        for bucket in self.buckets.values() {
            bucket.lock().reset();
        }
    }
}
