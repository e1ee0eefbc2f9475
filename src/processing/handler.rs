//! Business handler contract and the order handler
//!
//! A handler either returns normally or reports a [`HandlerError`]. It never
//! retries and never dead-letters on its own; the dispatcher owns both.

use crate::observability::metrics::metrics;
use crate::processing::idempotency::IdempotencyGuard;
use crate::protocol::{BusinessEvent, InboundMessage, OrderRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Error reported by a business handler
///
/// The variant is the handler's statement of what went wrong; the classifier
/// turns it into a failure kind.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The operation is semantically invalid; retrying cannot help
    #[error("Business rule violated: {message}")]
    Business { message: String },

    /// A dependency is unavailable or failed in a way expected to clear up
    #[error("Transient failure: {message}")]
    Transient { message: String },

    /// A dependency did not answer in time
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Anything the handler did not anticipate
    #[error("Unexpected failure: {0}")]
    Unexpected(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn business<S: Into<String>>(message: S) -> Self {
        Self::Business {
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn unexpected<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Unexpected(Box::new(error))
    }
}

/// Business handler invoked by the dispatcher once per attempt
#[async_trait]
pub trait Handler: Send + Sync {
    type Event: BusinessEvent;

    async fn handle(&self, message: &InboundMessage<Self::Event>) -> Result<(), HandlerError>;
}

/// Destination of applied orders
///
/// `ensure_ready` runs before the idempotency mark and may fail; `apply`
/// runs after it and cannot fail, so a marked order always has its effect.
#[async_trait]
pub trait OrderSink: Send + Sync {
    /// Check the downstream dependency before committing to the effect
    async fn ensure_ready(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Apply the business effect of an order
    async fn apply(&self, order: &OrderRequest, correlation_id: &str);
}

/// Sink that records processed orders in the service log
#[derive(Debug, Default, Clone)]
pub struct LoggingOrderSink;

#[async_trait]
impl OrderSink for LoggingOrderSink {
    async fn apply(&self, order: &OrderRequest, correlation_id: &str) {
        info!(
            order_id = %order.order_id,
            product = %order.product,
            quantity = order.quantity,
            correlation_id = %correlation_id,
            "Order processed"
        );
    }
}

/// Handler for inbound order events
pub struct OrderHandler {
    guard: Arc<dyn IdempotencyGuard>,
    sink: Arc<dyn OrderSink>,
}

impl OrderHandler {
    pub fn new(guard: Arc<dyn IdempotencyGuard>, sink: Arc<dyn OrderSink>) -> Self {
        Self { guard, sink }
    }

    /// Order handler writing processed orders to the log
    pub fn with_logging_sink(guard: Arc<dyn IdempotencyGuard>) -> Self {
        Self::new(guard, Arc::new(LoggingOrderSink))
    }

    fn validate(order: &OrderRequest) -> Result<(), HandlerError> {
        if order.quantity <= 0 {
            return Err(HandlerError::business(format!(
                "Invalid quantity: {}",
                order.quantity
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for OrderHandler {
    type Event = OrderRequest;

    async fn handle(&self, message: &InboundMessage<OrderRequest>) -> Result<(), HandlerError> {
        let order = &message.payload;
        debug!(
            order_id = %order.order_id,
            correlation_id = %message.correlation_id,
            attempt = message.attempt,
            "Handling order"
        );

        Self::validate(order)?;
        self.sink.ensure_ready().await?;

        if !self.guard.check_and_mark(&order.order_id) {
            metrics().duplicate_skipped();
            info!(
                order_id = %order.order_id,
                correlation_id = %message.correlation_id,
                "Order already processed, skipping duplicate delivery"
            );
            return Ok(());
        }

        self.sink.apply(order, &message.correlation_id).await;
        Ok(())
    }
}
