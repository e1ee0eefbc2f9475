//! Transport layer for the order channels
//!
//! This module provides the broker abstraction consumed by the dispatcher,
//! the producer and the dead-letter monitor, plus its MQTT v5 implementation.

use crate::protocol::{Delivery, DeliveryPosition, OutboundRecord};

pub mod mqtt;

/// Transport trait for channel consumption and publication
///
/// This trait provides an abstraction over the message broker (primarily
/// MQTT) to enable dependency injection and testing. Deliveries are pushed
/// to the consumer through the sender installed with
/// [`Transport::set_delivery_sender`]; each one stays uncommitted until
/// [`Transport::commit`] is called with its position.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the transport broker/server
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the transport broker/server
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Start consuming a channel within the configured consumer group
    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error>;

    /// Publish a record to a channel
    async fn publish(&self, channel: &str, record: &OutboundRecord) -> Result<(), Self::Error>;

    /// Acknowledge one delivery so it is not redelivered
    async fn commit(&self, position: &DeliveryPosition) -> Result<(), Self::Error>;

    /// Set the sender receiving inbound deliveries
    fn set_delivery_sender(&self, sender: tokio::sync::mpsc::Sender<Delivery>);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<crate::transport::mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
