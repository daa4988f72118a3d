//! Named retry policies.
//!
//! Fixed parameter sets referenced by name across the system (DLQ reason
//! mapping, webhook delivery, validation retries). Attempts = retries + 1.

use crate::backoff::{BackoffSettings, BackoffStrategy};
use crate::jitter::Jitter;
use crate::retry::RetryConfig;
use std::time::Duration;

/// A high-level retry policy; converts to a detailed [`RetryConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub const fn new(
        name: &'static str,
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Self {
        Self { name, max_retries, initial_delay, max_delay, backoff_multiplier, jitter }
    }

    pub fn backoff_settings(&self) -> BackoffSettings {
        let strategy = if (self.backoff_multiplier - 1.0).abs() < f64::EPSILON {
            BackoffStrategy::Fixed
        } else if self.jitter {
            BackoffStrategy::ExponentialWithJitter
        } else {
            BackoffStrategy::Exponential
        };
        BackoffSettings {
            strategy,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            exponential_base: self.backoff_multiplier,
            jitter: Jitter::from_factor(self.jitter, 0.5),
        }
    }

    pub fn to_config<E>(&self) -> RetryConfig<E> {
        let mut config = RetryConfig::default().max_attempts(self.max_retries + 1);
        config.backoff = self.backoff_settings();
        config
    }
}

/// Balanced default.
pub const STANDARD: RetryPolicy =
    RetryPolicy::new("standard", 3, Duration::from_secs(1), Duration::from_secs(10), 2.0, true);

/// Network/HTTP requests.
pub const NETWORK: RetryPolicy =
    RetryPolicy::new("network", 3, Duration::from_millis(500), Duration::from_secs(10), 2.0, true);

/// Slow-growing, few attempts.
pub const CONSERVATIVE: RetryPolicy =
    RetryPolicy::new("conservative", 2, Duration::from_secs(2), Duration::from_secs(20), 1.5, true);

/// Database operations.
pub const DATABASE: RetryPolicy =
    RetryPolicy::new("database", 5, Duration::from_secs(1), Duration::from_secs(30), 1.5, true);

/// Webhook deliveries: long, even gaps and no jitter.
pub const WEBHOOK: RetryPolicy =
    RetryPolicy::new("webhook", 3, Duration::from_secs(30), Duration::from_secs(300), 2.0, false);

/// Validation rarely recovers on retry.
pub const VALIDATION: RetryPolicy =
    RetryPolicy::new("validation", 1, Duration::from_secs(1), Duration::from_secs(1), 1.0, false);

/// Critical operations: many fast attempts.
pub const CRITICAL: RetryPolicy =
    RetryPolicy::new("critical", 10, Duration::from_millis(100), Duration::from_secs(60), 1.3, true);

/// Credential refresh paths.
pub const AUTH: RetryPolicy =
    RetryPolicy::new("auth", 2, Duration::from_secs(1), Duration::from_secs(5), 2.0, true);

const ALL: [&RetryPolicy; 8] =
    [&STANDARD, &NETWORK, &CONSERVATIVE, &DATABASE, &WEBHOOK, &VALIDATION, &CRITICAL, &AUTH];

/// Look up a policy by its registered name.
pub fn by_name(name: &str) -> Option<RetryPolicy> {
    ALL.iter().find(|p| p.name == name).map(|p| **p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_every_policy() {
        for policy in ALL {
            assert_eq!(by_name(policy.name), Some(*policy));
        }
        assert_eq!(by_name("nope"), None);
    }

    #[test]
    fn attempts_are_retries_plus_one() {
        let config: RetryConfig<std::io::Error> = STANDARD.to_config();
        assert_eq!(config.max_attempts, 4);
    }

    #[test]
    fn fixed_multiplier_maps_to_fixed_strategy() {
        let settings = VALIDATION.backoff_settings();
        assert_eq!(settings.strategy, BackoffStrategy::Fixed);
        assert_eq!(settings.jitter, Jitter::None);
    }

    #[test]
    fn webhook_is_jitterless_exponential() {
        let settings = WEBHOOK.backoff_settings();
        assert_eq!(settings.strategy, BackoffStrategy::Exponential);
        assert_eq!(settings.initial_delay, Duration::from_secs(30));
        assert_eq!(settings.max_delay, Duration::from_secs(300));
    }
}
