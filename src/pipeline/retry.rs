//! Retry policy: how many times a FAILED record is retried and when.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Bounded exponential backoff for FAILED records.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. `0` disables retrying.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Random spread added on top of the delay, as a fraction of it (0.0–1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(15 * 60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`, then
    /// stretched by up to `jitter` of itself.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = (base_secs * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        let spread = delay_secs * self.jitter.clamp(0.0, 1.0);
        let jittered = if spread > 0.0 {
            delay_secs + rand::thread_rng().gen_range(0.0..spread)
        } else {
            delay_secs
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// When a record that has already been retried `retry_count` times and
    /// just failed again may run next. `None` once the budget is spent: the
    /// record stays FAILED for a human.
    pub fn schedule(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if retry_count >= self.max_retries {
            return None;
        }
        let delay = chrono::Duration::from_std(self.next_delay(retry_count + 1)).ok()?;
        Some(now + delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = exact();
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        assert_eq!(exact().next_delay(0), Duration::from_secs(2));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..exact()
        };
        assert_eq!(policy.next_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.next_delay(2);
            assert!(d >= Duration::from_secs(4));
            assert!(d < Duration::from_secs(6));
        }
    }

    #[test]
    fn schedule_stops_after_max_retries() {
        let policy = exact();
        let now = Utc::now();
        assert_eq!(policy.schedule(0, now), Some(now + chrono::Duration::seconds(2)));
        assert_eq!(policy.schedule(2, now), Some(now + chrono::Duration::seconds(8)));
        assert_eq!(policy.schedule(3, now), None);
    }

    #[test]
    fn zero_retries_never_schedules() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..exact()
        };
        assert_eq!(policy.schedule(0, Utc::now()), None);
    }
}
