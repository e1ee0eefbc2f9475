//! Dead-letter routing
//!
//! Builds the diagnostic record for a terminally failed delivery and
//! publishes it once to the dead-letter channel. Publication is never
//! retried here; a failure is returned to the caller as-is.

use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::processing::classifier::FailureKind;
use crate::protocol::{
    BusinessEvent, DeadLetterReason, DeadLetterRecord, Delivery, InboundMessage, ProtocolError,
};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Dead-letter publication errors
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Failed to publish to dead-letter channel {channel}: {source}")]
    PublishFailed {
        channel: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Publishes failed deliveries to the dead-letter channel
pub struct DeadLetterRouter<T: Transport> {
    transport: Arc<T>,
    channel: String,
}

impl<T: Transport> DeadLetterRouter<T> {
    pub fn new(transport: Arc<T>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Dead-letter a message the handler gave up on
    ///
    /// `delivery` supplies the original payload bytes and key; the message
    /// supplies the correlation id and the attempt count.
    pub async fn route<E: BusinessEvent>(
        &self,
        delivery: &Delivery,
        message: &InboundMessage<E>,
        kind: FailureKind,
        failure_message: &str,
    ) -> Result<DeadLetterRecord, DeadLetterError> {
        let record = DeadLetterRecord {
            original_channel: message.channel.clone(),
            original_partition: message.position.partition,
            original_offset: message.position.offset,
            failure_message: sanitize_error_message(failure_message),
            reason: kind.into(),
            attempt_count: message.attempts_made(),
            correlation_id: message.correlation_id.clone(),
            timestamp: Utc::now(),
            key: delivery
                .key
                .clone()
                .or_else(|| Some(message.entity_id().to_string())),
            payload: delivery.payload.clone(),
        };

        self.publish(record).await
    }

    /// Dead-letter a delivery whose payload could not be decoded
    ///
    /// The handler never ran, so the attempt count is zero.
    pub async fn route_undecodable(
        &self,
        delivery: &Delivery,
        cause: &ProtocolError,
    ) -> Result<DeadLetterRecord, DeadLetterError> {
        let correlation_id = match delivery.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                let generated = Uuid::new_v4().to_string();
                warn!(
                    position = %delivery.position,
                    correlation_id = %generated,
                    "Undecodable delivery carried no correlation id, assigned a new one"
                );
                generated
            }
        };

        let record = DeadLetterRecord {
            original_channel: delivery.position.channel.clone(),
            original_partition: delivery.position.partition,
            original_offset: delivery.position.offset,
            failure_message: sanitize_error_message(&cause.to_string()),
            reason: DeadLetterReason::Deserialization,
            attempt_count: 0,
            correlation_id,
            timestamp: Utc::now(),
            key: delivery.key.clone(),
            payload: delivery.payload.clone(),
        };

        self.publish(record).await
    }

    async fn publish(&self, record: DeadLetterRecord) -> Result<DeadLetterRecord, DeadLetterError> {
        let outbound = record.to_outbound();

        match self.transport.publish(&self.channel, &outbound).await {
            Ok(()) => {
                metrics().dead_lettered(record.reason);
                warn!(
                    dead_letter_channel = %self.channel,
                    channel = %record.original_channel,
                    partition = record.original_partition,
                    offset = record.original_offset,
                    correlation_id = %record.correlation_id,
                    attempts = record.attempt_count,
                    reason = %record.reason,
                    failure = %record.failure_message,
                    "Message routed to dead-letter channel"
                );
                Ok(record)
            }
            Err(e) => {
                metrics().dead_letter_publish_failed();
                error!(
                    dead_letter_channel = %self.channel,
                    correlation_id = %record.correlation_id,
                    offset = record.original_offset,
                    error = %e,
                    "Failed to publish dead-letter record"
                );
                Err(DeadLetterError::PublishFailed {
                    channel: self.channel.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}
