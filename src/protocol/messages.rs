//! Message types exchanged over the order channels
//!
//! This module defines the order payload, the broker-level delivery and
//! outbound record envelopes, the decoded inbound message handed to business
//! handlers and the dead-letter record published on terminal failure.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Record headers (MQTT v5 user properties on the wire)
pub type Headers = BTreeMap<String, String>;

/// Header names used on the main and dead-letter channels
pub mod headers {
    /// Correlation identifier assigned once at origination
    pub const CORRELATION_ID: &str = "correlation-id";
    /// Payload type name, set by the producer
    pub const EVENT_TYPE: &str = "event-type";
    /// Partitioning key (the entity identifier)
    pub const KEY: &str = "key";
    /// Failure text of the last handler error
    pub const DLT_EXCEPTION_MESSAGE: &str = "dlt-exception-message";
    /// Channel the failed record was consumed from
    pub const DLT_ORIGINAL_TOPIC: &str = "dlt-original-topic";
    /// Partition the failed record was consumed from
    pub const DLT_ORIGINAL_PARTITION: &str = "dlt-original-partition";
    /// Position of the failed record within its partition
    pub const DLT_ORIGINAL_OFFSET: &str = "dlt-original-offset";
    /// Number of handler invocations before giving up
    pub const DLT_ATTEMPTS: &str = "dlt-attempts";
    /// Why the record was dead-lettered
    pub const DLT_REASON: &str = "dlt-reason";
    /// When the record was dead-lettered (RFC 3339)
    pub const DLT_TIMESTAMP: &str = "dlt-timestamp";
}

/// A business payload carried on the main channel
///
/// Implementors expose the identifier the idempotency guard keys on.
pub trait BusinessEvent:
    Serialize + DeserializeOwned + fmt::Debug + Clone + Send + Sync + 'static
{
    /// Type name attached to records as the `event-type` header
    const EVENT_TYPE: &'static str;

    /// Business entity identifier (idempotency and partitioning key)
    fn entity_id(&self) -> &str;
}

/// Order event payload
///
/// Structural validation (non-blank fields, positive quantity) happens at the
/// ingress before publication; the consumer still enforces the quantity rule
/// as a business failure.
///
/// # Examples
/// ```
/// use orderguard::protocol::{BusinessEvent, OrderRequest};
///
/// let order = OrderRequest::new("order-42", "keyboard", 2);
/// assert_eq!(order.entity_id(), "order-42");
///
/// let json = serde_json::to_string(&order).unwrap();
/// assert!(json.contains("\"orderId\":\"order-42\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Order identifier
    pub order_id: String,
    /// Product name
    pub product: String,
    /// Ordered quantity
    pub quantity: i64,
}

impl OrderRequest {
    pub fn new(order_id: impl Into<String>, product: impl Into<String>, quantity: i64) -> Self {
        Self {
            order_id: order_id.into(),
            product: product.into(),
            quantity,
        }
    }
}

impl BusinessEvent for OrderRequest {
    const EVENT_TYPE: &'static str = "OrderRequest";

    fn entity_id(&self) -> &str {
        &self.order_id
    }
}

/// Broker-assigned position of a delivery, used only for commit bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryPosition {
    pub channel: String,
    pub partition: u32,
    pub offset: u64,
}

impl DeliveryPosition {
    pub fn new(channel: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            channel: channel.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for DeliveryPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.channel, self.partition, self.offset)
    }
}

/// One unit delivered by the broker, before deserialization
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub position: DeliveryPosition,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(position: DeliveryPosition, payload: Vec<u8>, headers: Headers) -> Self {
        let key = headers.get(headers::KEY).cloned();
        Self {
            position,
            key,
            payload,
            headers,
            received_at: Utc::now(),
        }
    }

    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Correlation identifier propagated by the producer, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
            .filter(|value| !value.trim().is_empty())
    }
}

/// A record to publish on a channel
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl OutboundRecord {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Set the record key; it is also carried as the `key` header
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.headers.insert(headers::KEY.to_string(), key.clone());
        self.key = Some(key);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Decoded inbound message handed to business handlers
///
/// The envelope is immutable: a retry produces a new envelope through
/// [`InboundMessage::next_attempt`] with the attempt counter advanced by one.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage<E> {
    /// Business payload
    pub payload: E,
    /// Delivery attempt counter, 0 on the first handler invocation
    pub attempt: u32,
    /// Correlation identifier carried through every derived record and log
    pub correlation_id: String,
    /// Channel the message was consumed from
    pub channel: String,
    /// Broker position of the underlying delivery
    pub position: DeliveryPosition,
}

impl<E: BusinessEvent> InboundMessage<E> {
    /// Deserialize a delivery into an inbound message with attempt counter 0
    ///
    /// A delivery without a correlation identifier receives a fresh one so
    /// every log line and dead-letter record for it is traceable.
    pub fn decode(delivery: &Delivery) -> Result<Self, ProtocolError> {
        let payload: E =
            serde_json::from_slice(&delivery.payload).map_err(ProtocolError::Deserialization)?;

        let correlation_id = match delivery.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                warn!(
                    position = %delivery.position,
                    correlation_id = %generated,
                    "Delivery carried no correlation id, assigned a new one"
                );
                generated
            }
        };

        Ok(Self {
            payload,
            attempt: 0,
            correlation_id,
            channel: delivery.position.channel.clone(),
            position: delivery.position.clone(),
        })
    }

    /// Entity identifier of the payload
    pub fn entity_id(&self) -> &str {
        self.payload.entity_id()
    }
}

impl<E> InboundMessage<E> {
    /// Number of handler invocations including the current one
    pub fn attempts_made(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    /// Envelope for the next retry cycle
    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self
        }
    }
}

/// Why a record ended on the dead-letter channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Semantically invalid operation, never retried
    Business,
    /// Infrastructure failure that outlived the retry budget
    Transient,
    /// Unrecognized failure that outlived the retry budget
    Unknown,
    /// Payload could not be decoded before reaching the handler
    Deserialization,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Business => "business",
            DeadLetterReason::Transient => "transient",
            DeadLetterReason::Unknown => "unknown",
            DeadLetterReason::Deserialization => "deserialization",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "business" => Some(DeadLetterReason::Business),
            "transient" => Some(DeadLetterReason::Transient),
            "unknown" => Some(DeadLetterReason::Unknown),
            "deserialization" => Some(DeadLetterReason::Deserialization),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic record published to the dead-letter channel
///
/// Built once per terminal failure and never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub original_channel: String,
    pub original_partition: u32,
    pub original_offset: u64,
    pub failure_message: String,
    pub reason: DeadLetterReason,
    pub attempt_count: u32,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub key: Option<String>,
    /// Original payload bytes, possibly empty when decoding failed early
    pub payload: Vec<u8>,
}

impl DeadLetterRecord {
    /// Wire form: original payload plus diagnostic headers
    pub fn to_outbound(&self) -> OutboundRecord {
        let mut record = OutboundRecord::new(self.payload.clone())
            .with_header(headers::CORRELATION_ID, &self.correlation_id)
            .with_header(headers::DLT_EXCEPTION_MESSAGE, &self.failure_message)
            .with_header(headers::DLT_ORIGINAL_TOPIC, &self.original_channel)
            .with_header(
                headers::DLT_ORIGINAL_PARTITION,
                self.original_partition.to_string(),
            )
            .with_header(headers::DLT_ORIGINAL_OFFSET, self.original_offset.to_string())
            .with_header(headers::DLT_ATTEMPTS, self.attempt_count.to_string())
            .with_header(headers::DLT_REASON, self.reason.as_str())
            .with_header(headers::DLT_TIMESTAMP, self.timestamp.to_rfc3339());

        if let Some(key) = &self.key {
            record = record.with_key(key.clone());
        }
        record
    }

    /// Rebuild a record from a delivery on the dead-letter channel
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, ProtocolError> {
        let reason_raw = required_header(delivery, headers::DLT_REASON)?;
        let reason = DeadLetterReason::parse(reason_raw).ok_or_else(|| {
            ProtocolError::InvalidHeader {
                name: headers::DLT_REASON,
                value: reason_raw.to_string(),
            }
        })?;

        let timestamp_raw = required_header(delivery, headers::DLT_TIMESTAMP)?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_raw)
            .map_err(|_| ProtocolError::InvalidHeader {
                name: headers::DLT_TIMESTAMP,
                value: timestamp_raw.to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            original_channel: required_header(delivery, headers::DLT_ORIGINAL_TOPIC)?.to_string(),
            original_partition: numeric_header(delivery, headers::DLT_ORIGINAL_PARTITION)?,
            original_offset: numeric_header(delivery, headers::DLT_ORIGINAL_OFFSET)?,
            failure_message: required_header(delivery, headers::DLT_EXCEPTION_MESSAGE)?
                .to_string(),
            reason,
            attempt_count: numeric_header(delivery, headers::DLT_ATTEMPTS)?,
            correlation_id: required_header(delivery, headers::CORRELATION_ID)?.to_string(),
            timestamp,
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
        })
    }

    /// Payload rendered for logs; empty payloads render as `<empty>`
    pub fn payload_text(&self) -> String {
        if self.payload.is_empty() {
            "<empty>".to_string()
        } else {
            String::from_utf8_lossy(&self.payload).into_owned()
        }
    }
}

fn required_header<'a>(
    delivery: &'a Delivery,
    name: &'static str,
) -> Result<&'a str, ProtocolError> {
    delivery
        .header(name)
        .ok_or(ProtocolError::MissingHeader(name))
}

fn numeric_header<T: std::str::FromStr>(
    delivery: &Delivery,
    name: &'static str,
) -> Result<T, ProtocolError> {
    let raw = required_header(delivery, name)?;
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidHeader {
            name,
            value: raw.to_string(),
        })
}

/// Errors decoding records from the wire
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(#[source] serde_json::Error),
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),
    #[error("Invalid value for header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery_with(payload: &[u8], correlation_id: Option<&str>) -> Delivery {
        let mut headers = Headers::new();
        if let Some(id) = correlation_id {
            headers.insert(headers::CORRELATION_ID.to_string(), id.to_string());
        }
        headers.insert(headers::KEY.to_string(), "order-1".to_string());
        Delivery::new(DeliveryPosition::new("orders", 1, 7), payload.to_vec(), headers)
    }

    #[test]
    fn test_order_request_wire_format() {
        let json = r#"{"orderId":"order-1","product":"keyboard","quantity":3}"#;
        let order: OrderRequest = serde_json::from_str(json).unwrap();

        assert_eq!(order, OrderRequest::new("order-1", "keyboard", 3));
        assert_eq!(order.entity_id(), "order-1");
        assert_eq!(OrderRequest::EVENT_TYPE, "OrderRequest");
    }

    #[test]
    fn test_decode_inbound_message() {
        let delivery = delivery_with(
            br#"{"orderId":"order-1","product":"keyboard","quantity":3}"#,
            Some("corr-123"),
        );

        let message = InboundMessage::<OrderRequest>::decode(&delivery).unwrap();

        assert_eq!(message.attempt, 0);
        assert_eq!(message.attempts_made(), 1);
        assert_eq!(message.correlation_id, "corr-123");
        assert_eq!(message.channel, "orders");
        assert_eq!(message.position, DeliveryPosition::new("orders", 1, 7));
        assert_eq!(message.entity_id(), "order-1");
        assert_eq!(delivery.key.as_deref(), Some("order-1"));
    }

    #[test]
    fn test_decode_assigns_correlation_id_when_missing() {
        let delivery = delivery_with(
            br#"{"orderId":"order-1","product":"keyboard","quantity":3}"#,
            None,
        );

        let message = InboundMessage::<OrderRequest>::decode(&delivery).unwrap();
        assert!(Uuid::parse_str(&message.correlation_id).is_ok());
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let delivery = delivery_with(b"not json", Some("corr-1"));
        let result = InboundMessage::<OrderRequest>::decode(&delivery);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));

        let delivery = delivery_with(br#"{"orderId":"order-1"}"#, Some("corr-1"));
        let result = InboundMessage::<OrderRequest>::decode(&delivery);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_next_attempt_advances_counter_only() {
        let delivery = delivery_with(
            br#"{"orderId":"order-1","product":"keyboard","quantity":3}"#,
            Some("corr-123"),
        );
        let first = InboundMessage::<OrderRequest>::decode(&delivery).unwrap();
        let second = first.clone().next_attempt();
        let third = second.clone().next_attempt();

        assert_eq!(second.attempt, 1);
        assert_eq!(third.attempt, 2);
        assert_eq!(third.attempts_made(), 3);
        assert_eq!(third.correlation_id, first.correlation_id);
        assert_eq!(third.payload, first.payload);
        assert_eq!(third.position, first.position);
    }

    #[test]
    fn test_dead_letter_record_wire_headers() {
        let record = DeadLetterRecord {
            original_channel: "orders".to_string(),
            original_partition: 2,
            original_offset: 41,
            failure_message: "Invalid quantity: 0".to_string(),
            reason: DeadLetterReason::Business,
            attempt_count: 1,
            correlation_id: "corr-9".to_string(),
            timestamp: Utc::now(),
            key: Some("order-9".to_string()),
            payload: b"{}".to_vec(),
        };

        let outbound = record.to_outbound();
        assert_eq!(outbound.key.as_deref(), Some("order-9"));
        assert_eq!(outbound.payload, b"{}".to_vec());
        assert_eq!(outbound.headers[headers::CORRELATION_ID], "corr-9");
        assert_eq!(outbound.headers[headers::DLT_ORIGINAL_TOPIC], "orders");
        assert_eq!(outbound.headers[headers::DLT_ORIGINAL_PARTITION], "2");
        assert_eq!(outbound.headers[headers::DLT_ORIGINAL_OFFSET], "41");
        assert_eq!(outbound.headers[headers::DLT_ATTEMPTS], "1");
        assert_eq!(outbound.headers[headers::DLT_REASON], "business");
        assert_eq!(
            outbound.headers[headers::DLT_EXCEPTION_MESSAGE],
            "Invalid quantity: 0"
        );
    }

    #[test]
    fn test_dead_letter_record_from_delivery() {
        let original = DeadLetterRecord {
            original_channel: "orders".to_string(),
            original_partition: 0,
            original_offset: 5,
            failure_message: "timeout".to_string(),
            reason: DeadLetterReason::Transient,
            attempt_count: 3,
            correlation_id: "corr-5".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            key: Some("order-5".to_string()),
            payload: Vec::new(),
        };
        let outbound = original.to_outbound();
        let delivery = Delivery::new(
            DeliveryPosition::new("orders.DLT", 0, 0),
            outbound.payload,
            outbound.headers,
        );

        let decoded = DeadLetterRecord::from_delivery(&delivery).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.payload_text(), "<empty>");
    }

    #[test]
    fn test_dead_letter_record_missing_header() {
        let delivery = Delivery::new(
            DeliveryPosition::new("orders.DLT", 0, 0),
            Vec::new(),
            Headers::new(),
        );
        let result = DeadLetterRecord::from_delivery(&delivery);
        assert!(matches!(
            result,
            Err(ProtocolError::MissingHeader(headers::DLT_REASON))
        ));
    }

    #[test]
    fn test_dead_letter_reason_parse() {
        assert_eq!(
            DeadLetterReason::parse("Business"),
            Some(DeadLetterReason::Business)
        );
        assert_eq!(
            DeadLetterReason::parse("deserialization"),
            Some(DeadLetterReason::Deserialization)
        );
        assert_eq!(DeadLetterReason::parse("fatal"), None);
    }

    #[test]
    fn test_position_display() {
        assert_eq!(
            DeliveryPosition::new("orders", 3, 12).to_string(),
            "orders[3]@12"
        );
    }
}
