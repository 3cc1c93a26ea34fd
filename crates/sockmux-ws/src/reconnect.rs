//! Reconnect backoff policy
//!
//! Capped exponential backoff with random jitter to keep a fleet of
//! clients from redialing in lockstep after a gateway restart.

use std::time::Duration;

use crate::options::SocketOptions;

/// Backoff policy driving the reconnect loop
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Ceiling for the grown delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub growth: f64,
    /// Jitter fraction (0.0 to 1.0) applied around each delay
    pub jitter: f64,
    /// Attempt cap per outage; `None` retries forever
    pub max_attempts: Option<u32>,
    /// When false the loop never runs
    pub enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            growth: 2.0,
            jitter: 0.2,
            max_attempts: None,
            enabled: true,
        }
    }
}

impl ReconnectPolicy {
    /// Derive a policy from client options
    pub fn from_options(options: &SocketOptions) -> Self {
        Self {
            base_delay: options.reconnect_interval,
            max_attempts: options.max_reconnect_attempts,
            enabled: options.auto_reconnect,
            ..Default::default()
        }
    }

    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Whether attempt number `attempt` (1-indexed) should run at all
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled
            && match self.max_attempts {
                Some(max) => attempt <= max,
                None => true,
            }
    }

    /// The undithered delay for attempt number `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(24);
        let grown = self.base_delay.as_secs_f64() * self.growth.powi(exponent as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// The delay for `attempt` with jitter applied
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::random::<f64>() * 2.0 * spread - spread;
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(1),
            growth: 2.0,
            jitter: 0.0,
            max_attempts: None,
            enabled: true,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = policy(100);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn attempt_cap() {
        let mut policy = policy(10);
        policy.max_attempts = Some(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        assert!(!ReconnectPolicy::disabled().should_retry(1));
    }

    #[test]
    fn jitter_stays_near_base() {
        let mut policy = policy(100);
        policy.jitter = 0.5;
        for attempt in 1..=5 {
            let base = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay(attempt);
            let spread = base.mul_f64(0.5);
            assert!(jittered >= base.saturating_sub(spread));
            assert!(jittered <= base + spread + Duration::from_millis(1));
        }
    }

    #[test]
    fn from_options_picks_up_interval() {
        let options = SocketOptions::new("wss://x")
            .with_reconnect_interval(Duration::from_millis(250))
            .with_max_reconnect_attempts(7);
        let policy = ReconnectPolicy::from_options(&options);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, Some(7));
        assert!(policy.enabled);

        let off = ReconnectPolicy::from_options(&SocketOptions::new("wss://x").without_reconnect());
        assert!(!off.enabled);
    }
}
