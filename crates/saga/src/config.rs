//! Saga runtime configuration loaded from environment variables.

use std::time::Duration;

use domain::PaymentMethod;

/// Retry, deadline and relay settings for the saga.
///
/// Reads from environment variables:
/// - `SAGA_MAX_ATTEMPTS`: attempts per external call (default: `3`)
/// - `SAGA_BASE_DELAY_MS`: first backoff delay (default: `50`)
/// - `SAGA_MAX_DELAY_MS`: backoff ceiling (default: `1000`)
/// - `SAGA_CALL_DEADLINE_MS`: deadline for a single call (default: `2000`)
/// - `SAGA_RELAY_INTERVAL_MS`: outbox relay period (default: `1000`)
/// - `SAGA_PAYMENT_METHOD`: method used to charge orders (default: `card`)
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_deadline: Duration,
    pub relay_interval: Duration,
    pub payment_method: PaymentMethod,
}

impl SagaConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("SAGA_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_millis("SAGA_BASE_DELAY_MS").unwrap_or(defaults.base_delay),
            max_delay: env_millis("SAGA_MAX_DELAY_MS").unwrap_or(defaults.max_delay),
            call_deadline: env_millis("SAGA_CALL_DEADLINE_MS").unwrap_or(defaults.call_deadline),
            relay_interval: env_millis("SAGA_RELAY_INTERVAL_MS")
                .unwrap_or(defaults.relay_interval),
            payment_method: env_parse("SAGA_PAYMENT_METHOD").unwrap_or(defaults.payment_method),
        }
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1000),
            call_deadline: Duration::from_millis(2000),
            relay_interval: Duration::from_millis(1000),
            payment_method: PaymentMethod::Card,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SagaConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(50));
        assert_eq!(config.call_deadline, Duration::from_secs(2));
        assert_eq!(config.payment_method, PaymentMethod::Card);
    }
}
