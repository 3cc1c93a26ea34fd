//! Token-bucket primitives for client-side rate limiting
//!
//! Buckets are plain synchronous state machines; the async wait-and-retry
//! loop lives with the socket client, which owns a set of named buckets.

use std::time::{Duration, Instant};

/// Upper bound on the time to mint one token; a non-positive refill rate
/// lands here, making the bucket effectively non-refilling.
const MAX_MINT_INTERVAL: Duration = Duration::from_secs(86_400);

/// Token bucket rate limiter
///
/// Tokens are spent by requests and minted back one at a time, each after
/// a fixed interval derived from the refill rate. Accounting is in whole
/// tokens: the mint clock advances only by full intervals, so partial
/// progress toward the next token carries over between calls without any
/// floating-point drift.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens (bucket capacity)
    capacity: u32,
    /// Tokens currently available to spend
    available: u32,
    /// Time to mint one token
    mint_interval: Duration,
    /// Start of the interval minting the next token
    minting_since: Instant,
}

impl TokenBucket {
    /// Create a new bucket at full capacity
    ///
    /// `refill_rate` is tokens per second; a non-positive rate yields a
    /// bucket that never refills in practice.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let mint_interval = if refill_rate > 0.0 {
            Duration::from_secs_f64((1.0 / refill_rate).clamp(1e-9, MAX_MINT_INTERVAL.as_secs_f64()))
        } else {
            MAX_MINT_INTERVAL
        };
        Self {
            capacity,
            available: capacity,
            mint_interval,
            minting_since: Instant::now(),
        }
    }

    /// Try to take `tokens` from the bucket
    ///
    /// Returns `Ok(())` when the tokens were taken, or `Err(wait)` with the
    /// time until enough tokens will have been minted.
    pub fn try_acquire(&mut self, tokens: u32) -> Result<(), Duration> {
        self.mint();
        if tokens <= self.available {
            self.available -= tokens;
            return Ok(());
        }
        let missing = tokens - self.available;
        let ready_at = self.minting_since + self.mint_interval * missing;
        Err(ready_at.saturating_duration_since(Instant::now()))
    }

    /// Check availability without spending
    pub fn check_available(&mut self, tokens: u32) -> bool {
        self.mint();
        tokens <= self.available
    }

    /// Currently available whole tokens
    pub fn available(&mut self) -> u32 {
        self.mint();
        self.available
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill the bucket to capacity
    pub fn reset(&mut self) {
        self.available = self.capacity;
        self.minting_since = Instant::now();
    }

    /// Credit every token whose mint interval has fully elapsed
    fn mint(&mut self) {
        let now = Instant::now();
        if self.available >= self.capacity {
            // a full bucket mints nothing; keep the clock current
            self.minting_since = now;
            return;
        }
        let elapsed = now.duration_since(self.minting_since);
        let minted = (elapsed.as_nanos() / self.mint_interval.as_nanos())
            .min(u128::from(self.capacity - self.available)) as u32;
        if minted == 0 {
            return;
        }
        self.available += minted;
        if self.available == self.capacity {
            self.minting_since = now;
        } else {
            self.minting_since += self.mint_interval * minted;
        }
    }
}

/// Configuration for a single token bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens
    pub capacity: u32,
    /// Tokens per second refill rate
    pub refill_rate: f64,
}

impl BucketConfig {
    /// Create a new bucket configuration
    pub const fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Build a bucket from this configuration
    pub fn create_bucket(&self) -> TokenBucket {
        TokenBucket::new(self.capacity, self.refill_rate)
    }
}

/// Outcome of an acquisition attempt against a named bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    /// The request may proceed
    Allowed,
    /// The request must wait before proceeding
    Limited {
        /// How long until enough tokens are available
        wait: Duration,
    },
}

impl AcquireOutcome {
    /// True when the request may proceed immediately
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The wait duration when limited
    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::Limited { wait } => Some(*wait),
        }
    }
}
