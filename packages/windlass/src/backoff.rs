//! Exponential backoff with jitter.
//!
//! Pure: given an attempt count, produce a delay. The deterministic part is
//! `min(max_delay, base_delay * 2^attempt)`; a uniform jitter in [0, 1s) is
//! added on top to avoid synchronized retry storms.

use std::time::Duration;

/// Upper bound of the uniform jitter added to every delay.
const JITTER_MAX_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl BackoffCalculator {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based:
    /// the delay after the first failure is `base_delay` plus jitter).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Saturate the shift so large attempt counts clamp to max_delay
        // instead of overflowing.
        let exp = attempt.min(32);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        scaled + Duration::from_millis(fastrand::u64(0..JITTER_MAX_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt_within_jitter() {
        let backoff = BackoffCalculator::new(Duration::from_secs(1), Duration::from_secs(3600));

        for (attempt, expected_secs) in [(0u32, 1u64), (1, 2), (2, 4), (3, 8)] {
            let d = backoff.delay(attempt);
            let floor = Duration::from_secs(expected_secs);
            assert!(d >= floor, "attempt {attempt}: {d:?} < {floor:?}");
            assert!(
                d < floor + Duration::from_millis(JITTER_MAX_MS),
                "attempt {attempt}: {d:?} exceeds jitter bound"
            );
        }
    }

    #[test]
    fn delay_is_capped_at_max() {
        let backoff = BackoffCalculator::new(Duration::from_secs(1), Duration::from_secs(60));
        let d = backoff.delay(30);
        assert!(d >= Duration::from_secs(60));
        assert!(d < Duration::from_secs(61));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let backoff = BackoffCalculator::default();
        let d = backoff.delay(u32::MAX);
        assert!(d <= backoff.max_delay + Duration::from_millis(JITTER_MAX_MS));
    }
}
