//! Reconnection backoff for the primary channel.

use std::time::Duration;

use murmur_core::config::ReconnectConfig;
use rand::Rng;

/// Doubling delay schedule with a cap, random spread and an attempt limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Wait before the first attempt.
    pub base: Duration,
    pub cap: Duration,
    pub factor: f64,
    /// Relative spread, so 0.25 gives a delay anywhere in 75%..=125%.
    pub jitter: f64,
    /// Automatic attempts before giving up.
    pub limit: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            factor: config.multiplier,
            jitter: config.jitter,
            limit: config.max_attempts,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt` (0-based), without jitter.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn nominal(&self, attempt: u32) -> Duration {
        let grown = self.base.as_millis() as f64 * self.factor.powi(attempt.min(64) as i32);
        let ms = grown.min(self.cap.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay actually waited before attempt `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        self.nominal(attempt).mul_f64(spread)
    }

    pub const fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_config() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base, Duration::from_secs(2));
        assert_eq!(backoff.cap, Duration::from_secs(30));
        assert!((backoff.factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(backoff.limit, 8);
    }

    #[test]
    fn schedule_doubles_until_capped() {
        let backoff = Backoff::default();
        let secs: Vec<u64> = (0..8).map(|n| backoff.nominal(n).as_secs()).collect();
        assert_eq!(secs, [2, 4, 8, 16, 30, 30, 30, 30]);
        assert_eq!(backoff.nominal(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let backoff = Backoff::default();
        for attempt in 0..8 {
            let nominal = backoff.nominal(attempt);
            for _ in 0..50 {
                let d = backoff.next_delay(attempt);
                assert!(d >= nominal.mul_f64(0.75), "{d:?} below band for {nominal:?}");
                assert!(d <= nominal.mul_f64(1.25), "{d:?} above band for {nominal:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(backoff.next_delay(1), Duration::from_secs(4));
    }

    #[test]
    fn exhausted_at_limit() {
        let backoff = Backoff {
            limit: 3,
            ..Default::default()
        };
        assert!(!backoff.exhausted(0));
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
        assert!(backoff.exhausted(9));
    }

    #[test]
    fn built_from_custom_config() {
        let config = ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 400,
            ..ReconnectConfig::default()
        };
        let backoff = Backoff::from(&config);
        assert_eq!(backoff.nominal(0), Duration::from_millis(100));
        assert_eq!(backoff.nominal(5), Duration::from_millis(400));
    }
}
