//! Retry backoff

use outpost_common::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_max_ms: u64,
}

impl BackoffPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
            jitter_max_ms: config.jitter_max_ms,
        }
    }

    /// `min(cap, base * 2^(attempts-1))` for the attempt that just failed
    pub fn base_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 63) as u32;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Base delay plus jitter drawn from `[0, jitter_max)`
    pub fn delay(&self, attempts: i32) -> Duration {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_max_ms)
        };
        self.base_delay(attempts) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(jitter_max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1000,
            cap_ms: 10_000,
            jitter_max_ms,
        }
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let policy = policy(0);
        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(8000));
        assert_eq!(policy.base_delay(5), Duration::from_millis(10_000));
        assert_eq!(policy.base_delay(80), Duration::from_millis(10_000));
    }

    #[test]
    fn test_zero_attempts_uses_base() {
        assert_eq!(policy(0).base_delay(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = policy(250);
        for attempts in 1..6 {
            let base = policy.base_delay(attempts);
            for _ in 0..200 {
                let delay = policy.delay(attempts);
                assert!(delay >= base);
                assert!(delay < base + Duration::from_millis(250));
            }
        }
    }

    #[test]
    fn test_from_config() {
        let policy = BackoffPolicy::new(&RetryConfig::default());
        assert_eq!(policy.base_ms, 1000);
        assert_eq!(policy.cap_ms, 300_000);
        assert_eq!(policy.jitter_max_ms, 1000);
    }
}
