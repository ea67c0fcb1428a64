//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound before jitter.
    pub max_delay: Duration,

    /// Extra random delay, as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay without jitter: `min(base_delay * 2^attempt, max_delay)`.
    ///
    /// `attempt` is 0-indexed, so the first retry waits `base_delay`.
    /// Example with base_delay=1s, max_delay=30s:
    /// - attempt 0: 1s
    /// - attempt 1: 2s
    /// - attempt 4: 16s
    /// - attempt 5 and later: 30s
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// [`Self::backoff`] plus up to `jitter_ratio` of it at random.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.jitter_ratio, 0.1);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(4, 16)]
    #[case(5, 30)]
    #[case(40, 30)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let base = policy.backoff(attempt);
            let delay = policy.next_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.1));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }
}
