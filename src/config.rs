//! Configuration for the order consumer and its tools
//!
//! Loaded from a TOML file. Only `[broker]` is required; the channel, retry
//! and consumer sections fall back to defaults. Credentials are never stored
//! in the file, only the names of the environment variables holding them.

use crate::processing::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::protocol::topics::{
    validate_channel_name, validate_group_name, ValidationError, DEFAULT_DEAD_LETTER_CHANNEL,
    DEFAULT_MAIN_CHANNEL,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub channels: ChannelsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub consumer: ConsumerSection,
}

/// Broker connection and consumer group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host[:port]` or `mqtts://host[:port]`
    pub url: String,
    /// Consumer group name (must match [a-zA-Z0-9._-]+)
    pub group: String,
    /// Stable client identifier for the persistent session
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Give up reconnecting after this many attempts (unset = never give up)
    pub max_reconnect_attempts: Option<u32>,
}

fn default_keep_alive_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelsSection {
    #[serde(default = "default_main_channel")]
    pub main: String,
    #[serde(default = "default_dead_letter_channel")]
    pub dead_letter: String,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            main: default_main_channel(),
            dead_letter: default_dead_letter_channel(),
        }
    }
}

fn default_main_channel() -> String {
    DEFAULT_MAIN_CHANNEL.to_string()
}

fn default_dead_letter_channel() -> String {
    DEFAULT_DEAD_LETTER_CHANNEL.to_string()
}

/// Retry budget for transient and unknown failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Handler invocations per message, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_delay_ms() -> u64 {
    2000
}

/// Partition workers and shutdown behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    /// Number of partitions, one worker each
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Deliveries buffered per worker before the router waits
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Time workers get to finish after shutdown is signalled
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_partitions() -> u32 {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid consumer group '{group}': {source}")]
    InvalidGroup {
        group: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid channel name '{channel}': {source}")]
    InvalidChannel {
        channel: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Configuration with default channels, retry and consumer sections
    pub fn new(broker_url: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            broker: BrokerSection {
                url: broker_url.into(),
                group: group.into(),
                client_id: None,
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive_secs(),
                max_reconnect_attempts: None,
            },
            channels: ChannelsSection::default(),
            retry: RetrySection::default(),
            consumer: ConsumerSection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field and naming constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.url cannot be empty".to_string(),
            ));
        }

        validate_group_name(&self.broker.group).map_err(|source| ConfigError::InvalidGroup {
            group: self.broker.group.clone(),
            source,
        })?;

        for channel in [&self.channels.main, &self.channels.dead_letter] {
            validate_channel_name(channel).map_err(|source| ConfigError::InvalidChannel {
                channel: channel.clone(),
                source,
            })?;
        }

        if self.channels.main == self.channels.dead_letter {
            return Err(ConfigError::InvalidConfig(format!(
                "Main and dead-letter channels must differ (both are '{}')",
                self.channels.main
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.consumer.partitions == 0 {
            return Err(ConfigError::InvalidConfig(
                "consumer.partitions must be at least 1".to_string(),
            ));
        }

        if self.consumer.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "consumer.queue_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy described by the `[retry]` section
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
        )
    }

    /// Client identifier for the persistent broker session
    pub fn client_id(&self) -> String {
        self.broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-consumer", self.broker.group))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.consumer.shutdown_grace_secs)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get broker username from environment variable
    pub fn get_broker_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get broker password from environment variable
    pub fn get_broker_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Require the username when a variable name is configured
    pub fn require_broker_username(&self) -> Result<Option<String>, ConfigError> {
        match &self.broker.username_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost:1883"
group = "order-group"
client_id = "order-group-1"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[channels]
main = "shop/orders"
dead_letter = "shop/orders.DLT"

[retry]
max_attempts = 5
delay_ms = 250

[consumer]
partitions = 8
queue_capacity = 16
shutdown_grace_secs = 2
"#;

        let config = RelayConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.group, "order-group");
        assert_eq!(config.client_id(), "order-group-1");
        assert_eq!(config.channels.main, "shop/orders");
        assert_eq!(config.retry_policy().max_attempts(), 5);
        assert_eq!(config.retry_policy().delay(), Duration::from_millis(250));
        assert_eq!(config.consumer.partitions, 8);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost:1883"
group = "order-group"
"#;

        let config = RelayConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.channels.main, "orders");
        assert_eq!(config.channels.dead_letter, "orders.DLT");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, 2000);
        assert_eq!(config.consumer.partitions, 4);
        assert_eq!(config.consumer.queue_capacity, 100);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.client_id(), "order-group-consumer");
        assert_eq!(config, RelayConfig::new("mqtt://localhost:1883", "order-group"));
    }

    #[test]
    fn test_invalid_group() {
        let config = RelayConfig::new("mqtt://localhost:1883", "order group");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGroup { .. })
        ));
    }

    #[test]
    fn test_wildcard_channel_rejected() {
        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        config.channels.main = "orders/#".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn test_same_channels_rejected() {
        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        config.channels.dead_letter = "orders".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        config.consumer.partitions = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        config.consumer.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_broker_section() {
        let result = RelayConfig::from_toml_str("[retry]\nmax_attempts = 2\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_required_username_env() {
        let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
        assert_eq!(config.require_broker_username().unwrap(), None);

        config.broker.username_env = Some("ORDERGUARD_TEST_UNSET_USERNAME".to_string());
        assert!(matches!(
            config.require_broker_username(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
        assert_eq!(config.get_broker_username(), None);
    }
}
