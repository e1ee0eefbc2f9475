//! Pure message routing and delivery mapping for MQTT events
//!
//! Routing decisions, header mapping between MQTT v5 user properties and
//! record headers, and the table of deliveries awaiting acknowledgement.

use crate::protocol::{
    partition_for_key, Delivery, DeliveryPosition, Headers, OutboundRecord,
};
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Payload content type advertised on published records
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT v5 event to the supervisor branch that handles it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(publish.clone()),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained publishes are broker replays of old state, never new orders
    pub fn should_process_message(publish: &Publish) -> bool {
        if publish.retain {
            debug!(
                topic = %String::from_utf8_lossy(&publish.topic),
                "Ignoring retained message"
            );
            return false;
        }
        true
    }

    /// Record headers carried as MQTT v5 user properties
    pub fn extract_headers(properties: Option<&PublishProperties>) -> Headers {
        properties
            .map(|props| props.user_properties.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish properties for an outbound record
    pub fn build_publish_properties(record: &OutboundRecord) -> PublishProperties {
        PublishProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            user_properties: record
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            ..PublishProperties::default()
        }
    }

    /// Partition for a record: keyed records hash the key, others hash the topic
    pub fn assign_partition(headers: &Headers, topic: &str, partitions: u32) -> u32 {
        let key = headers
            .get(crate::protocol::headers::KEY)
            .map(String::as_str)
            .filter(|key| !key.is_empty())
            .unwrap_or(topic);
        partition_for_key(key, partitions)
    }

    /// Map an MQTT publish to a delivery at the given offset
    pub fn build_delivery(publish: &Publish, offset: u64, partitions: u32) -> Delivery {
        let channel = String::from_utf8_lossy(&publish.topic).to_string();
        let headers = Self::extract_headers(publish.properties.as_ref());
        let partition = Self::assign_partition(&headers, &channel, partitions);

        Delivery::new(
            DeliveryPosition::new(channel, partition, offset),
            publish.payload.to_vec(),
            headers,
        )
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged { session_present: bool },
    /// The full publish is kept so it can be acknowledged on commit
    MessageReceived(Publish),
    Disconnected,
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<String>,
    },
    /// PingResp, PubAck and similar housekeeping
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Deliveries handed to the consumer but not yet acknowledged
///
/// Offsets increase monotonically for the lifetime of the client.
#[derive(Debug, Default)]
pub struct PendingAcks {
    next_offset: AtomicU64,
    pending: Mutex<HashMap<u64, Publish>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a publish until it is committed; returns its offset
    pub fn track(&self, publish: Publish) -> u64 {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.insert(offset, publish);
        offset
    }

    /// Remove and return the publish held for an offset
    pub fn take(&self, offset: u64) -> Option<Publish> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.remove(&offset)
    }

    /// Drop every pending entry; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pushes deliveries to the consumer (impure I/O)
#[derive(Default)]
pub struct MessageForwarder {
    delivery_sender: Mutex<Option<mpsc::Sender<Delivery>>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>) {
        let mut slot = self
            .delivery_sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(sender);
    }

    /// Forward a delivery; waits while the consumer queue is full
    pub async fn forward_delivery(&self, delivery: Delivery) -> Result<(), String> {
        let sender = self
            .delivery_sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        match sender {
            Some(sender) => {
                debug!(position = %delivery.position, "Forwarding delivery to consumer");
                sender
                    .send(delivery)
                    .await
                    .map_err(|e| format!("Failed to forward delivery to consumer: {e}"))
            }
            None => {
                warn!("Received MQTT message but no delivery sender configured - message left un-acknowledged");
                Err("No delivery sender configured".to_string())
            }
        }
    }
}
