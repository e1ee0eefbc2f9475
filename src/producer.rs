//! Producer side of the main channel
//!
//! Publishes order payloads with the correlation identifier, event type and
//! partitioning key attached as headers.

use crate::protocol::{
    headers, validate_channel_name, BusinessEvent, OrderRequest, OutboundRecord, ValidationError,
};
use crate::transport::Transport;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Producer errors
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(#[from] ValidationError),
    #[error("Correlation id must not be blank")]
    BlankCorrelationId,
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to publish to {channel}")]
    PublishFailed {
        channel: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Publishes orders to the main channel
pub struct OrderProducer<T: Transport> {
    transport: Arc<T>,
    channel: String,
}

impl<T: Transport> OrderProducer<T> {
    pub fn new(transport: Arc<T>, channel: impl Into<String>) -> Result<Self, ProducerError> {
        let channel = channel.into();
        validate_channel_name(&channel)?;
        Ok(Self { transport, channel })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Build the record published for an order
    pub fn build_record(
        order: &OrderRequest,
        correlation_id: &str,
    ) -> Result<OutboundRecord, ProducerError> {
        if correlation_id.trim().is_empty() {
            return Err(ProducerError::BlankCorrelationId);
        }

        let payload = serde_json::to_vec(order)?;
        Ok(OutboundRecord::new(payload)
            .with_key(order.entity_id())
            .with_header(headers::CORRELATION_ID, correlation_id)
            .with_header(headers::EVENT_TYPE, OrderRequest::EVENT_TYPE))
    }

    /// Publish one order
    pub async fn send(&self, order: &OrderRequest, correlation_id: &str) -> Result<(), ProducerError> {
        let record = Self::build_record(order, correlation_id)?;

        match self.transport.publish(&self.channel, &record).await {
            Ok(()) => {
                info!(
                    channel = %self.channel,
                    order_id = %order.order_id,
                    correlation_id = %correlation_id,
                    "Order published"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    channel = %self.channel,
                    order_id = %order.order_id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to publish order"
                );
                Err(ProducerError::PublishFailed {
                    channel: self.channel.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    #[tokio::test]
    async fn test_send_sets_headers() {
        let transport = Arc::new(MockTransport::new());
        let producer = OrderProducer::new(transport.clone(), "orders").unwrap();

        producer
            .send(&OrderRequest::new("order-7", "desk", 1), "corr-7")
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        let (channel, record) = &published[0];
        assert_eq!(channel, "orders");
        assert_eq!(record.key.as_deref(), Some("order-7"));
        assert_eq!(record.headers.get(headers::CORRELATION_ID).map(String::as_str), Some("corr-7"));
        assert_eq!(record.headers.get(headers::EVENT_TYPE).map(String::as_str), Some("OrderRequest"));
        assert_eq!(record.headers.get(headers::KEY).map(String::as_str), Some("order-7"));

        let order: OrderRequest = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(order, OrderRequest::new("order-7", "desk", 1));
    }

    #[tokio::test]
    async fn test_send_reports_publish_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_publishes(true);
        let producer = OrderProducer::new(transport, "orders").unwrap();

        let result = producer.send(&OrderRequest::new("order-7", "desk", 1), "corr-7").await;
        assert!(matches!(result, Err(ProducerError::PublishFailed { .. })));
    }

    #[test]
    fn test_blank_correlation_id_rejected() {
        let result = OrderProducer::<MockTransport>::build_record(&OrderRequest::new("o", "p", 1), "  ");
        assert!(matches!(result, Err(ProducerError::BlankCorrelationId)));
    }

    #[test]
    fn test_wildcard_channel_rejected() {
        let transport = Arc::new(MockTransport::new());
        assert!(OrderProducer::new(transport, "orders/#").is_err());
    }
}
