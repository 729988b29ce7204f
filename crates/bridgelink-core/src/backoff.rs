//! Exponential backoff with symmetric jitter.
//!
//! ```text
//! center = min(initial_delay * multiplier^attempt, max_delay)
//! delay  = max(center + uniform(-jitter_factor*center, +jitter_factor*center), 100 ms)
//! ```
//!
//! `attempt` is 0-indexed: attempt 0 is the wait before the first retry.
//!
//! # Why jitter? (for beginners)
//!
//! When a bridge reboots, every companion device that was talking to it
//! notices at the same moment.  Without jitter they would all retry on the
//! exact same schedule and hammer the bridge in lock-step.  Spreading each
//! wait by ±30 % breaks the herd apart.

use std::time::Duration;

use rand::Rng;

/// No computed delay is ever shorter than this.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Parameters of the backoff curve plus the retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Wait before the first retry (attempt 0), before jitter.
    pub initial_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound for the center value.
    pub max_delay: Duration,
    /// Fraction of the center value used as the jitter half-width.
    pub jitter_factor: f64,
    /// Retries after the first attempt; the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    /// | Field          | Default  |
    /// |----------------|----------|
    /// | initial_delay  | 1000 ms  |
    /// | multiplier     | 2.0      |
    /// | max_delay      | 30000 ms |
    /// | jitter_factor  | 0.3      |
    /// | max_retries    | 3        |
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.3,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Returns the un-jittered delay for `attempt`.
    ///
    /// Non-decreasing in `attempt` (for `multiplier >= 1`) until it saturates
    /// at `max_delay`, and never below [`MIN_DELAY`].
    pub fn center_delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        // NaN and overflow both collapse onto the cap.
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        let capped = capped.max(0.0);

        Duration::from_millis(capped as u64).max(MIN_DELAY)
    }

    /// Returns the jittered delay for `attempt`, drawing randomness from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let center = self.center_delay(attempt).as_millis() as f64;
        let spread = (center * self.jitter_factor.clamp(0.0, 1.0)).max(0.0);

        let offset = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };

        let jittered = (center + offset).max(MIN_DELAY.as_millis() as f64);
        Duration::from_millis(jittered.round() as u64)
    }

    /// Returns the jittered delay for `attempt` using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Total number of times an operation may run under this policy.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_policy_matches_documented_values() {
        let p = BackoffPolicy::default();
        assert_eq!(p.initial_delay, Duration::from_millis(1000));
        assert_eq!(p.multiplier, 2.0);
        assert_eq!(p.max_delay, Duration::from_millis(30_000));
        assert_eq!(p.jitter_factor, 0.3);
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn test_center_delay_attempt_five_is_capped_at_max() {
        // Arrange
        let p = BackoffPolicy::default();

        // Act: 1000 * 2^5 = 32000 > 30000
        let center = p.center_delay(5);

        // Assert
        assert_eq!(center, Duration::from_millis(30_000));
    }

    #[test]
    fn test_center_delay_doubles_until_cap() {
        let p = BackoffPolicy::default();
        assert_eq!(p.center_delay(0), Duration::from_millis(1000));
        assert_eq!(p.center_delay(1), Duration::from_millis(2000));
        assert_eq!(p.center_delay(2), Duration::from_millis(4000));
        assert_eq!(p.center_delay(4), Duration::from_millis(16_000));
    }

    #[test]
    fn test_center_delay_is_non_decreasing_and_floored() {
        // Arrange: a tiny initial delay exercises the 100 ms floor.
        let p = BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            ..BackoffPolicy::default()
        };

        // Act / Assert
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let d = p.center_delay(attempt);
            assert!(d >= previous, "attempt {attempt}: {d:?} < {previous:?}");
            assert!(d >= MIN_DELAY);
            assert!(d <= p.max_delay);
            previous = d;
        }
    }

    #[test]
    fn test_center_delay_huge_attempt_does_not_overflow() {
        let p = BackoffPolicy::default();
        assert_eq!(p.center_delay(u32::MAX), p.max_delay);
    }

    #[test]
    fn test_jittered_delay_stays_within_band() {
        // Arrange
        let p = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);

        // Act / Assert
        for attempt in 0..8 {
            let center = p.center_delay(attempt).as_millis() as f64;
            for _ in 0..200 {
                let d = p.delay_with(attempt, &mut rng).as_millis() as f64;
                assert!(d >= center * 0.7 - 1.0, "{d} below band for {center}");
                assert!(d <= center * 1.3 + 1.0, "{d} above band for {center}");
            }
        }
    }

    #[test]
    fn test_jittered_delay_never_below_floor() {
        // Arrange: center sits on the floor and jitter pulls downwards.
        let p = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            jitter_factor: 1.0,
            ..BackoffPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);

        // Act / Assert
        for _ in 0..500 {
            assert!(p.delay_with(0, &mut rng) >= MIN_DELAY);
        }
    }

    #[test]
    fn test_zero_jitter_returns_center() {
        let p = BackoffPolicy {
            jitter_factor: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.delay(3), Duration::from_millis(8000));
    }
}
