//! # Retry Schedule
//!
//! Delivery retries back off exponentially per row: the delay after the
//! n-th failure is `base × 2^min(n, 6)` with ±20% jitter, which caps the
//! schedule at roughly five minutes for the default 5 second base. The
//! attempt counter lives on the result row itself, so the schedule
//! survives restarts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Default backoff base.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Doubling stops after this many attempts.
pub const BACKOFF_EXPONENT_CAP: i64 = 6;

/// Jitter applied to every delay, as a fraction of the raw value.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before the next attempt, given how many attempts have already
/// failed.
pub fn backoff_delay(base: Duration, attempts: i64) -> Duration {
    let exponent = attempts.clamp(0, BACKOFF_EXPONENT_CAP) as u32;
    let raw = base * 2u32.pow(exponent);

    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    raw.mul_f64(1.0 + jitter)
}

/// Absolute time of the next attempt.
pub fn next_attempt_at(now: DateTime<Utc>, base: Duration, attempts: i64) -> DateTime<Utc> {
    now + chrono::Duration::from_std(backoff_delay(base, attempts))
        .unwrap_or_else(|_| chrono::Duration::seconds(300))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_within_jitter(delay: Duration, raw_secs: f64) {
        let secs = delay.as_secs_f64();
        assert!(
            secs >= raw_secs * (1.0 - JITTER_FRACTION) - f64::EPSILON
                && secs <= raw_secs * (1.0 + JITTER_FRACTION) + f64::EPSILON,
            "delay {:.2}s outside ±20% of {:.2}s",
            secs,
            raw_secs
        );
    }

    #[test]
    fn schedule_doubles_per_attempt() {
        let base = DEFAULT_BACKOFF_BASE;
        assert_within_jitter(backoff_delay(base, 0), 5.0);
        assert_within_jitter(backoff_delay(base, 1), 10.0);
        assert_within_jitter(backoff_delay(base, 2), 20.0);
        assert_within_jitter(backoff_delay(base, 3), 40.0);
    }

    #[test]
    fn schedule_caps_at_exponent_six() {
        let base = DEFAULT_BACKOFF_BASE;
        // 5s × 2^6 = 320s regardless of how high the counter climbs.
        assert_within_jitter(backoff_delay(base, 6), 320.0);
        assert_within_jitter(backoff_delay(base, 50), 320.0);
    }

    #[test]
    fn jitter_varies_the_delay() {
        let base = Duration::from_secs(100);
        let samples: Vec<Duration> = (0..32).map(|_| backoff_delay(base, 0)).collect();
        let first = samples[0];
        // With ±20% jitter, 32 identical samples would be a broken RNG.
        assert!(samples.iter().any(|d| d != &first));
    }

    #[test]
    fn next_attempt_is_in_the_future() {
        let now = Utc::now();
        let next = next_attempt_at(now, DEFAULT_BACKOFF_BASE, 1);
        assert!(next > now);
    }
}
