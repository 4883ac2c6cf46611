//! Exponential backoff policy for job retries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::defaults;

/// Retry delay policy.
///
/// The delay before attempt `n` may run again is
///
/// ```text
/// delay(n) = min(base * multiplier^(n - 1), max)
/// ```
///
/// optionally spread by a symmetric jitter fraction: with `jitter = 0.1` the
/// final delay is drawn uniformly from `[0.9 * delay, 1.1 * delay]`. Jitter
/// avoids synchronized retry bursts from concurrent workers; set it to `0.0`
/// for deterministic scheduling in tests.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max: Duration,
    /// Symmetric jitter fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(defaults::BACKOFF_BASE_SECS),
            multiplier: defaults::BACKOFF_MULTIPLIER,
            max: Duration::from_secs(defaults::BACKOFF_MAX_SECS),
            jitter: defaults::BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the given attempt (1-based) may run again.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.max(1) - 1;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Wall-clock time at which the given attempt becomes eligible.
    pub fn next_eligible_at(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default().without_jitter()
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(30));
        assert_eq!(p.delay_for(2), Duration::from_secs(60));
        assert_eq!(p.delay_for(3), Duration::from_secs(120));
        assert_eq!(p.delay_for(4), Duration::from_secs(240));
    }

    #[test]
    fn test_delay_is_capped() {
        let p = policy();
        // 30 * 2^9 = 15360s, well past the 3600s cap
        assert_eq!(p.delay_for(10), Duration::from_secs(3600));
        assert_eq!(p.delay_for(100), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_and_negative_attempts_use_base() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(30));
        assert_eq!(p.delay_for(-3), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = BackoffPolicy {
            base: Duration::from_secs(100),
            multiplier: 2.0,
            max: Duration::from_secs(10_000),
            jitter: 0.1,
        };
        for _ in 0..50 {
            let d = p.delay_for(1).as_secs_f64();
            assert!((90.0..=110.0).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_next_eligible_at_advances_clock() {
        let p = policy();
        let now = Utc::now();
        let at = p.next_eligible_at(now, 2);
        assert_eq!((at - now).num_seconds(), 60);
    }
}
