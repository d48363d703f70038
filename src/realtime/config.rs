//! # Real-Time Configuration
//!
//! Timing and retry policy for the connection monitor and reconnection.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{RealtimeError, RealtimeResult};

/// Delay policy between automatic reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always wait `reconnect_delay_ms`
    Fixed,
    /// Double the delay per consecutive attempt, capped at `max_reconnect_delay_ms`
    Exponential,
}

/// Real-time client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Schema used when a subscription does not name one
    pub schema: String,

    /// Link state polling interval
    pub poll_interval_ms: u64,

    /// Reconnect delay policy
    pub backoff: BackoffStrategy,

    /// Base reconnect delay
    pub reconnect_delay_ms: u64,

    /// Upper bound for exponential backoff
    pub max_reconnect_delay_ms: u64,

    /// Spread delays by ±20%
    pub jitter: bool,

    /// Consecutive automatic attempts before the monitor gives up
    pub max_reconnect_attempts: u32,

    /// Bound on re-establishing the provider link
    pub reconnect_timeout_ms: u64,

    /// Bound on a single channel join handshake
    pub subscribe_timeout_ms: u64,

    /// Also schedule a reconnect when the link is observed closed
    pub reconnect_on_disconnect: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            poll_interval_ms: 5_000,
            backoff: BackoffStrategy::Exponential,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            jitter: true,
            max_reconnect_attempts: 10,
            reconnect_timeout_ms: 15_000,
            subscribe_timeout_ms: 10_000,
            reconnect_on_disconnect: true,
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> RealtimeResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: RealtimeConfig = serde_json::from_str(&content)
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject values that would stall or spin the monitor
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.schema.trim().is_empty() {
            return Err(RealtimeError::ConfigError("schema must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.reconnect_timeout_ms == 0 || self.subscribe_timeout_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(RealtimeError::ConfigError(format!(
                "max_reconnect_delay_ms ({}) is below reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.reconnect_delay_ms
            )));
        }
        Ok(())
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_delay_ms = base.as_millis() as u64;
        self.max_reconnect_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect_on_disconnect(mut self, enabled: bool) -> Self {
        self.reconnect_on_disconnect = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Delay before automatic attempt number `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_delay_ms;
        let millis = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => base
                .saturating_mul(1u64 << attempt.min(20))
                .min(self.max_reconnect_delay_ms),
        };

        if !self.jitter || millis == 0 {
            return Duration::from_millis(millis);
        }
        let spread = millis / 5;
        let low = millis - spread;
        let high = millis.saturating_add(spread);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RealtimeConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_backoff() {
        let config = RealtimeConfig::default()
            .with_backoff(BackoffStrategy::Fixed)
            .with_jitter(false);
        assert_eq!(config.backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(7), Duration::from_millis(1_000));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RealtimeConfig::default()
            .with_jitter(false)
            .with_reconnect_delay(Duration::from_millis(500), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(4_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RealtimeConfig::default().with_backoff(BackoffStrategy::Fixed);
        for _ in 0..50 {
            let delay = config.backoff_delay(0).as_millis();
            assert!((800..=1_200).contains(&delay));
        }
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = RealtimeConfig::default()
            .with_reconnect_delay(Duration::from_secs(10), Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(RealtimeError::ConfigError(_))
        ));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"poll_interval_ms": 250, "backoff": "fixed"}}"#).unwrap();

        let config = RealtimeConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.backoff, BackoffStrategy::Fixed);
        assert_eq!(config.reconnect_timeout_ms, 15_000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"poll_interval_ms": 0}}"#).unwrap();

        assert!(RealtimeConfig::load(file.path()).is_err());
    }
}
