//! Test helpers and utilities for integration tests

#![allow(dead_code)]

use orderguard::config::RelayConfig;
use orderguard::protocol::{headers, Delivery, DeliveryPosition, Headers, OrderRequest};
use std::time::Duration;

/// Configuration with short retry delays for integration tests
pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::new("mqtt://localhost:1883", "order-group");
    config.retry.max_attempts = 3;
    config.retry.delay_ms = 20;
    config.consumer.partitions = 2;
    config.consumer.queue_capacity = 16;
    config.consumer.shutdown_grace_secs = 1;
    config
}

/// Retry delay matching [`test_config`]
pub const TEST_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Delivery of an order as the producer would publish it
pub fn order_delivery(order: &OrderRequest, partition: u32, offset: u64) -> Delivery {
    let payload = serde_json::to_vec(order).unwrap();
    let mut headers = Headers::new();
    headers.insert(
        headers::CORRELATION_ID.to_string(),
        format!("corr-{}-{offset}", order.order_id),
    );
    headers.insert(headers::EVENT_TYPE.to_string(), "OrderRequest".to_string());
    headers.insert(headers::KEY.to_string(), order.order_id.clone());
    Delivery::new(DeliveryPosition::new("orders", partition, offset), payload, headers)
}

/// Delivery carrying an arbitrary raw payload
pub fn raw_delivery(payload: &[u8], offset: u64) -> Delivery {
    let mut headers = Headers::new();
    headers.insert(headers::CORRELATION_ID.to_string(), format!("corr-raw-{offset}"));
    Delivery::new(DeliveryPosition::new("orders", 0, offset), payload.to_vec(), headers)
}
