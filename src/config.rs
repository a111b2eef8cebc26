// config.rs - Agency and protocol configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Phase timeouts, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTimeouts {
    /// How long a manager may stay `initiated` before announcing
    pub initiate_ms: i64,

    /// Announce period, also the deadline contractors have to reply
    pub announce_ms: i64,

    /// How long a contractor waits for a decision on its bid
    pub bid_ms: i64,

    /// Deadline for granted work to be reported
    pub grant_ms: i64,

    /// How long a contractor waits for the acknowledgement of its final report
    pub ack_ms: i64,

    /// Validity of one-way notices (refusal, rejection, cancellation, reports)
    pub message_ttl_ms: i64,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            initiate_ms: 10_000,
            announce_ms: 10_000,
            bid_ms: 10_000,
            grant_ms: 10_000,
            ack_ms: 10_000,
            message_ttl_ms: 10_000,
        }
    }
}

impl ProtocolTimeouts {
    /// Every phase bounded by the same timeout
    pub fn uniform(millis: i64) -> Self {
        Self {
            initiate_ms: millis,
            announce_ms: millis,
            bid_ms: millis,
            grant_ms: millis,
            ack_ms: millis,
            message_ttl_ms: millis,
        }
    }
}

/// Agency configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    pub timeouts: ProtocolTimeouts,

    /// Finished session summaries kept for inspection
    pub history_limit: usize,

    /// Drop inbound messages whose expiration time already passed
    pub drop_expired_messages: bool,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            timeouts: ProtocolTimeouts::default(),
            history_limit: 64,
            drop_expired_messages: true,
        }
    }
}

impl AgencyConfig {
    /// Environment variable prefix, e.g. `CNP__TIMEOUTS__GRANT_MS=5000`
    pub const ENV_PREFIX: &'static str = "CNP";

    /// Layer defaults, an optional config file and `CNP__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AgencyConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn with_timeouts(mut self, timeouts: ProtocolTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
