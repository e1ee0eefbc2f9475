//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management and
//! MQTT option construction.

use crate::config::BrokerSection;
use rumqttc::v5::mqttbytes::v5::ConnectProperties;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Session expiry requested from the broker, so un-acknowledged deliveries
/// survive a reconnect
pub const SESSION_EXPIRY_SECS: u32 = 3600;

/// Maximum packet size accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![100, 250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Reconnection settings for a broker section
    pub fn for_broker(broker: &BrokerSection) -> Self {
        Self {
            max_attempts: broker.max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Calculate backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Acknowledgement failed")]
    CommitFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid channel: {0}")]
    InvalidChannel(#[from] crate::protocol::ValidationError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build MQTT options for a persistent, manually acknowledged session
///
/// The client id must be stable across restarts so the broker can resume the
/// session and redeliver anything left un-acknowledged.
pub fn configure_mqtt_options(
    client_id: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, MqttError> {
    let url =
        Url::parse(&config.url).map_err(|_| MqttError::InvalidBrokerUrl(config.url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.url.clone()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(config.url.clone())),
    };
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    let mut properties = ConnectProperties::new();
    properties.session_expiry_interval = Some(SESSION_EXPIRY_SECS);
    properties.max_packet_size = Some(MAX_PACKET_SIZE);
    mqtt_options.set_connect_properties(properties);

    // PUBACK only on commit; the session keeps un-acked deliveries
    mqtt_options.set_manual_acks(true);
    mqtt_options.set_clean_start(false);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(url: &str) -> BrokerSection {
        crate::config::RelayConfig::new(url, "order-group").broker
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![100, 250, 500, 1000, 2000]);
        assert_eq!(config.sustained_delay, 5000);
        assert_eq!(config.calculate_max_total_time(), None);
    }

    #[test]
    fn test_reconnect_config_for_broker() {
        let mut section = broker("mqtt://localhost:1883");
        section.max_reconnect_attempts = Some(3);

        let config = ReconnectConfig::for_broker(&section);
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.calculate_max_total_time(), Some(100 + 250 + 500));
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert_eq!(config.calculate_backoff_delay(5), 2000);
        assert_eq!(config.calculate_backoff_delay(6), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);

        let flat = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 750,
        };
        assert_eq!(flat.calculate_backoff_delay(1), 750);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("order-group-1", &broker("mqtt://localhost:1883"));
        assert!(options.is_ok());

        let options = configure_mqtt_options("order-group-1", &broker("mqtts://broker:8883"));
        assert!(options.is_ok());
    }

    #[test]
    fn test_persistent_session_options() {
        let options =
            configure_mqtt_options("order-group-1", &broker("mqtt://localhost:1883")).unwrap();

        assert!(options.manual_acks());
        assert!(!options.clean_start());

        let properties = options.connect_properties().expect("connect properties set");
        assert_eq!(properties.session_expiry_interval, Some(SESSION_EXPIRY_SECS));
        assert_eq!(properties.max_packet_size, Some(MAX_PACKET_SIZE));
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["not-a-url", "http://localhost:1883", "mqtt://"] {
            let result = configure_mqtt_options("order-group-1", &broker(url));
            assert!(
                matches!(result, Err(MqttError::InvalidBrokerUrl(_))),
                "expected rejection of {url}"
            );
        }
    }

    #[test]
    fn test_mqtt_error_display() {
        let error = MqttError::InvalidBrokerUrl("bad://url".to_string());
        assert_eq!(error.to_string(), "Invalid broker URL: bad://url");

        let error = MqttError::NotConnected {
            state: ConnectionState::Reconnecting(2),
        };
        assert!(error.to_string().contains("Reconnecting(2)"));
    }
}
