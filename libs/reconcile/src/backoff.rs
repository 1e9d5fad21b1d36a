//! Exponential backoff and bounded retry accounting.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay (before jitter).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0) applied as +/- a fraction of the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for tests and deterministic schedules.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let spread = delay * jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }
}

/// Counts failures per key inside a sliding window.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_retries: u32,
    window: Duration,
    failures: HashMap<K, (u32, Instant)>,
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: HashMap::new(),
        }
    }

    /// Record a failure and return the attempt number it represents (1-based).
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Failures recorded for `key` inside the current window.
    pub fn attempts(&self, key: &K) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    /// True once more than `max_retries` failures landed inside the window.
    pub fn is_exhausted(&self, key: &K) -> bool {
        self.attempts(key) > self.max_retries
    }

    /// Forget a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(3, 800)]
    #[case(10, 5_000)]
    fn test_fixed_backoff_doubles_until_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(policy.delay(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: 0.25,
        };
        for _ in 0..200 {
            let d = policy.delay(0).as_millis();
            assert!((750..=1250).contains(&d), "delay {d} out of band");
        }
    }

    #[test]
    fn test_retry_tracker_exhausts_after_max() {
        let mut tracker = RetryTracker::new(2, Duration::from_secs(60));
        let key = "default/gs-1".to_string();

        assert_eq!(tracker.record_failure(&key), 1);
        assert_eq!(tracker.record_failure(&key), 2);
        assert!(!tracker.is_exhausted(&key));
        assert_eq!(tracker.record_failure(&key), 3);
        assert!(tracker.is_exhausted(&key));

        tracker.clear(&key);
        assert_eq!(tracker.attempts(&key), 0);
    }
}
