//! Exponential backoff, shared by scheduler loop recovery, bus redelivery,
//! and proxy rate-limit cooloff.
//!
//! A small reusable policy type rather than a single free function, since
//! this system needs the same doubling-capped shape tuned three different
//! ways (crash recovery, message redelivery, scheduler jitter).

use std::time::Duration;

use rand::Rng;

/// A `base * factor^attempt` backoff policy, capped at `cap` and bounded to
/// `max_attempts` tries before giving up. Attempts are zero-indexed.
/// `jitter` is a fraction (0.0..1.0) of the capped delay to randomly spread
/// the actual delay by, so that many callers backing off at once don't all
/// wake up on the same tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl RetryPolicy {
    /// The recovery policy for a crashed scheduler control loop: 60s base,
    /// doubling, capped at 600s, up to 10 respawn attempts before the task
    /// is marked failed. No jitter: recovery attempts are already isolated
    /// per task, so there is nothing to de-synchronize.
    pub fn scheduler_recovery() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            factor: 2.0,
            cap: Duration::from_secs(600),
            max_attempts: 10,
            jitter: 0.0,
        }
    }

    /// The redelivery policy for a bus message that a consumer failed to
    /// process because the bus itself (or its backing store) was
    /// unavailable: 5s base, doubling, capped at 300s, up to 8 attempts,
    /// with 10% jitter so many stuck messages don't all retry in lockstep.
    pub fn bus_redelivery() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            factor: 2.0,
            cap: Duration::from_secs(300),
            max_attempts: 8,
            jitter: 0.1,
        }
    }

    /// The retry policy for a parsing worker's own fetch attempts (rate
    /// limited, upstream 5xx, or transport failure): 1s base, doubling,
    /// capped at 4s, up to 3 attempts — the exact 1s/2s/4s schedule before a
    /// terminal failed result is published.
    pub fn worker_fetch_retry() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(4),
            max_attempts: 3,
            jitter: 0.0,
        }
    }

    /// The delay before the `attempt`'th retry (0-indexed). Returns `None`
    /// once `attempt` has exhausted `max_attempts`.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.cap.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Some(Duration::from_secs_f64(delay))
    }

    /// Whether an `attempt`'th retry is still permitted under this policy.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            factor: 2.0,
            cap: Duration::from_secs(600),
            max_attempts: 10,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(120)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(240)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(480)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(600)));
        assert_eq!(policy.delay_for(9), Some(Duration::from_secs(600)));
    }

    #[test]
    fn delay_is_none_once_attempts_exhausted() {
        let policy = RetryPolicy::scheduler_recovery();
        assert_eq!(policy.delay_for(10), None);
        assert!(!policy.allows(10));
    }

    #[test]
    fn worker_fetch_retry_follows_the_one_two_four_second_schedule() {
        let policy = RetryPolicy::worker_fetch_retry();
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(3), None);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn jittered_delay_stays_within_the_configured_spread() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(100),
            factor: 1.0,
            cap: Duration::from_secs(100),
            max_attempts: 5,
            jitter: 0.1,
        };
        for attempt in 0..5 {
            let delay = policy.delay_for(attempt).unwrap().as_secs_f64();
            assert!((90.0..=110.0).contains(&delay), "delay {delay} outside expected spread");
        }
    }
}
