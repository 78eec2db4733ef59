//! Broker configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::BrokerError;

/// Broker-wide settings.
///
/// Durations are given in milliseconds when deserialized
/// (`queue_size_poll_interval_ms`, `timed_out_poll_interval_ms`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prefix for thread names and log fields
    pub name: String,
    /// How often the watcher checks queue sizes
    #[serde(rename = "queue_size_poll_interval_ms", with = "millis")]
    pub queue_size_poll_interval: Duration,
    /// How often the watcher reclaims timed-out messages
    #[serde(rename = "timed_out_poll_interval_ms", with = "millis")]
    pub timed_out_poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "rmb".to_string(),
            queue_size_poll_interval: Duration::from_secs(10),
            timed_out_poll_interval: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub const ENV_NAME: &'static str = "RMB_NAME";
    pub const ENV_QUEUE_SIZE_POLL_INTERVAL_MS: &'static str = "RMB_QUEUE_SIZE_POLL_INTERVAL_MS";
    pub const ENV_TIMED_OUT_POLL_INTERVAL_MS: &'static str = "RMB_TIMED_OUT_POLL_INTERVAL_MS";

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue_size_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_size_poll_interval = interval;
        self
    }

    pub fn with_timed_out_poll_interval(mut self, interval: Duration) -> Self {
        self.timed_out_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.name.trim().is_empty() {
            return Err(BrokerError::configuration("name must not be blank"));
        }
        if self.queue_size_poll_interval.is_zero() {
            return Err(BrokerError::configuration(
                "queue_size_poll_interval must be greater than zero",
            ));
        }
        if self.timed_out_poll_interval.is_zero() {
            return Err(BrokerError::configuration(
                "timed_out_poll_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `RMB_*` environment variables.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BrokerError> {
        let mut config = Self::default();
        if let Some(name) = lookup(Self::ENV_NAME) {
            config.name = name;
        }
        if let Some(ms) = lookup(Self::ENV_QUEUE_SIZE_POLL_INTERVAL_MS) {
            config.queue_size_poll_interval = parse_millis(Self::ENV_QUEUE_SIZE_POLL_INTERVAL_MS, &ms)?;
        }
        if let Some(ms) = lookup(Self::ENV_TIMED_OUT_POLL_INTERVAL_MS) {
            config.timed_out_poll_interval = parse_millis(Self::ENV_TIMED_OUT_POLL_INTERVAL_MS, &ms)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, BrokerError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| BrokerError::configuration(format!("{key}={value:?}: {e}")))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
