//! Serde-backed wiring configuration.
//!
//! ```rust
//! use requeue::config::ConsumerConfig;
//!
//! let config = ConsumerConfig::from_json_str(r#"{
//!     "senders": ["audit"],
//!     "receivers": [{
//!         "name": "orders",
//!         "retry": { "max_attempts": 5, "delay_intervals_ms": [1000, 5000] }
//!     }]
//! }"#).unwrap();
//! assert_eq!(config.policy_for(&config.receivers[0]).unwrap().max_attempts(), 5);
//! ```

use crate::error::BrokerError;
use crate::policy::{BuildError, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Retry budget and schedule as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_intervals_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, delay_intervals_ms: vec![1_000, 5_000, 10_000] }
    }
}

impl TryFrom<RetryConfig> for RetryPolicy {
    type Error = BuildError;

    fn try_from(config: RetryConfig) -> Result<Self, Self::Error> {
        RetryPolicy::builder()
            .max_attempts(config.max_attempts)
            .delays_ms(config.delay_intervals_ms)
            .build()
    }
}

/// A consumed entity; `retry` overrides the consumer-wide default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Senders and receivers wired for one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Destinations to open senders for up front.
    pub senders: Vec<String>,
    pub receivers: Vec<ReceiverConfig>,
    pub default_retry: RetryConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid consumer configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid retry policy for '{destination}': {source}")]
    InvalidPolicy {
        destination: String,
        #[source]
        source: BuildError,
    },
    #[error("failed to open receiver for '{destination}': {source}")]
    Receiver {
        destination: String,
        #[source]
        source: BrokerError,
    },
}

impl ConsumerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_slice(json: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Validated policy for `receiver`, falling back to `default_retry`.
    pub fn policy_for(&self, receiver: &ReceiverConfig) -> Result<RetryPolicy, ConfigError> {
        let retry = receiver.retry.clone().unwrap_or_else(|| self.default_retry.clone());
        RetryPolicy::try_from(retry).map_err(|source| ConfigError::InvalidPolicy {
            destination: receiver.name.clone(),
            source,
        })
    }
}
