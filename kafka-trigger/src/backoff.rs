use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy.
///
/// - initial_delay: base delay for attempt 0
/// - multiplier: factor by which delay grows each attempt (> 1.0)
/// - max_delay: cap for the computed delay
/// - jitter: draw the actual delay uniformly from `[0, next_delay]` (full jitter)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 2.0, Duration::from_secs(30))
    }
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            jitter: true,
        }
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let scaled = if pow.is_finite() {
            self.initial_delay.mul_f64(pow)
        } else {
            self.max_delay
        };
        scaled.min(self.max_delay)
    }

    /// The delay to actually sleep for, jittered when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.next_delay(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        ceiling.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_progression_and_cap() {
        let p = BackoffPolicy::default();

        let cases = vec![
            (0, 100),
            (1, 200),
            (2, 400),
            (5, 3_200),
            (8, 25_600),
            (9, 30_000), // 51_200 capped
            (50, 30_000),
            (u32::MAX, 30_000),
        ];

        for (attempt, expected_ms) in cases {
            let d = p.next_delay(attempt);
            assert_eq!(d.as_millis(), expected_ms, "attempt {attempt}");
        }
    }

    #[test]
    fn test_full_jitter_stays_under_ceiling() {
        let p = BackoffPolicy::default();
        for attempt in 0..12 {
            for _ in 0..20 {
                assert!(p.delay_for(attempt) <= p.next_delay(attempt));
            }
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let p = BackoffPolicy::new(Duration::from_millis(5), 3.0, Duration::from_millis(70))
            .without_jitter();
        assert_eq!(p.delay_for(0), Duration::from_millis(5));
        assert_eq!(p.delay_for(1), Duration::from_millis(15));
        assert_eq!(p.delay_for(3), Duration::from_millis(70));
    }
}
