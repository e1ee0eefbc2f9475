//! Orderguard - reliable order consumption
//!
//! Consumes order events from a broker channel and guarantees that each order
//! is applied at most once, transient failures are retried a bounded number of
//! times, and anything that cannot be processed ends up on a dead-letter
//! channel with enough diagnostics to investigate it.
//!
//! # Overview
//!
//! - Protocol types: order payload, deliveries, dead-letter records
//! - Processing core: idempotency guard, failure classifier, retry policy,
//!   dead-letter router and dispatcher
//! - Partitioned consumer with per-partition ordering
//! - MQTT v5 transport with shared subscriptions and manual acknowledgement
//! - Producer for the main channel
//!
//! # Quick Start
//!
//! ```rust
//! use orderguard::processing::{classify, FailureKind, HandlerError, RetryPolicy};
//! use orderguard::protocol::{BusinessEvent, OrderRequest};
//! use std::time::Duration;
//!
//! let order = OrderRequest::new("order-42", "keyboard", 2);
//! assert_eq!(order.entity_id(), "order-42");
//!
//! // Business failures go straight to the dead-letter channel
//! let failure = HandlerError::business("Quantity must be positive");
//! assert_eq!(classify(&failure), FailureKind::Business);
//!
//! // Transient failures are retried up to the attempt limit
//! let policy = RetryPolicy::new(3, Duration::from_millis(2000));
//! assert_eq!(policy.max_attempts(), 3);
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod observability;
pub mod processing;
pub mod producer;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, RelayConfig};
pub use consumer::ConsumerLifecycle;
pub use error::{RelayError, RelayResult};
pub use processing::{Dispatcher, Handler, HandlerError, OrderHandler};
pub use producer::{OrderProducer, ProducerError};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
