//! Exponential restart backoff.

use std::time::Duration;

use stackd_core::config::RestartSettings;

#[derive(Debug, Clone)]
pub struct RestartBackoff {
    /// Delay before the first restart.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Applied to the delay after each consecutive restart.
    pub multiplier: f64,
    /// Consecutive restarts allowed before giving up (None = unlimited).
    pub max_restarts: Option<u32>,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::from_settings(&RestartSettings::default())
    }
}

impl RestartBackoff {
    pub const fn from_settings(settings: &RestartSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            max_restarts: settings.max_restarts,
        }
    }

    /// Delay before restart number `attempt` (0-indexed).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_restarts.is_none_or(|max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let backoff = RestartBackoff::default();
        assert_eq!(backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
        assert_eq!(backoff.max_restarts, Some(5));
    }

    #[test]
    fn exponential_delays_are_capped() {
        let backoff = RestartBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_restarts: None,
        };

        // 1s, 2s, 4s, ... 32s, 60s (capped)
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(backoff.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn bounded_retries() {
        let backoff = RestartBackoff {
            max_restarts: Some(2),
            ..Default::default()
        };
        assert!(backoff.should_retry(0));
        assert!(backoff.should_retry(1));
        assert!(!backoff.should_retry(2));
    }

    #[test]
    fn unlimited_retries() {
        let backoff = RestartBackoff {
            max_restarts: None,
            ..Default::default()
        };
        assert!(backoff.should_retry(u32::MAX));
    }
}
