//! MQTT v5 binding of the [`Transport`](crate::transport::Transport) trait
//!
//! Pure functions are kept apart from I/O so most of the binding can be
//! tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - connection state, reconnect settings, MQTT options
//! - [`message_handler`] - event routing, header mapping, pending acknowledgements
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the client and its reconnection supervisor
//!
//! A consumer group is an MQTT v5 shared subscription
//! (`$share/{group}/{channel}`), and committing a delivery sends its PUBACK.
//! Un-acknowledged deliveries stay in the persistent session and are
//! redelivered after a reconnect or restart.
//!
//! # Usage
//!
//! ```rust,no_run
//! use orderguard::config::RelayConfig;
//! use orderguard::transport::{mqtt::MqttClient, Transport};
//!
//! # tokio_test::block_on(async {
//! let config = RelayConfig::new("mqtt://localhost:1883", "order-service");
//!
//! let mut client = MqttClient::new(&config.client_id(), config.broker.clone(), 4)?;
//! client.connect().await?;
//! client.subscribe("orders").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler, PendingAcks};
