//! Revalidation policy attached to each subscription.

use crate::error::ConfigError;
use std::time::Duration;

/// Staleness window and polling behaviour for a cached key.
///
/// There is no `Default`; every caller chooses its own
/// expiration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationPolicy {
    /// Data younger than this is never re-fetched unless forced.
    pub expiration: Duration,
    /// Whether the scheduler polls this key on an interval.
    pub auto_refresh: bool,
    /// Background re-check cadence. Only meaningful with `auto_refresh`.
    pub poll_interval: Duration,
}

impl RevalidationPolicy {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            auto_refresh: false,
            poll_interval: Duration::ZERO,
        }
    }

    /// Enable interval polling.
    pub fn with_polling(mut self, poll_interval: Duration) -> Self {
        self.auto_refresh = true;
        self.poll_interval = poll_interval;
        self
    }

    /// Live-updating list: 2 second staleness window, polled every 4 seconds.
    pub fn live_list() -> Self {
        Self::new(Duration::from_secs(2)).with_polling(Duration::from_secs(4))
    }

    /// Data that only changes through explicit mutation. Never polled.
    pub fn on_mutation(expiration: Duration) -> Self {
        Self::new(expiration)
    }

    /// Minimum gap between automatic retries after a failed load.
    pub fn retry_cooldown(&self) -> Duration {
        if self.auto_refresh {
            self.poll_interval
        } else {
            self.expiration
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_refresh && self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "poll_interval_ms must be positive when auto_refresh is enabled"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_list_preset() {
        let policy = RevalidationPolicy::live_list();
        assert!(policy.auto_refresh);
        assert_eq!(policy.expiration, Duration::from_secs(2));
        assert_eq!(policy.poll_interval, Duration::from_secs(4));
        assert_eq!(policy.retry_cooldown(), Duration::from_secs(4));
    }

    #[test]
    fn test_on_mutation_preset_never_polls() {
        let policy = RevalidationPolicy::on_mutation(Duration::from_secs(300));
        assert!(!policy.auto_refresh);
        assert_eq!(policy.retry_cooldown(), Duration::from_secs(300));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_polling_requires_positive_interval() {
        let policy = RevalidationPolicy::new(Duration::from_secs(1)).with_polling(Duration::ZERO);
        assert!(policy.validate().is_err());
    }
}
