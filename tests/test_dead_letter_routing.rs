//! Dead-letter routing tests
//!
//! Checks what the dead-letter channel receives and that the monitor side
//! can read it back.

mod test_helpers;

use orderguard::processing::{DeadLetterError, DeadLetterRouter, FailureKind};
use orderguard::protocol::{
    headers, DeadLetterReason, DeadLetterRecord, Delivery, DeliveryPosition, InboundMessage,
    OrderRequest,
};
use orderguard::testing::MockTransport;
use std::sync::Arc;
use test_helpers::{order_delivery, raw_delivery};

/// Turn a published record into the delivery the monitor would receive
fn as_dead_letter_delivery(record: &orderguard::protocol::OutboundRecord, offset: u64) -> Delivery {
    Delivery::new(
        DeliveryPosition::new("orders.DLT", 0, offset),
        record.payload.clone(),
        record.headers.clone(),
    )
}

#[tokio::test]
async fn test_exhausted_transient_failure_record_is_readable_by_monitor() {
    let transport = Arc::new(MockTransport::new());
    let router = DeadLetterRouter::new(transport.clone(), "orders.DLT");

    let delivery = order_delivery(&OrderRequest::new("order-1", "lamp", 1), 3, 17);
    let message = InboundMessage::<OrderRequest>::decode(&delivery)
        .unwrap()
        .next_attempt()
        .next_attempt();

    let record = router
        .route(&delivery, &message, FailureKind::Transient, "Inventory service unavailable")
        .await
        .unwrap();
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.reason, DeadLetterReason::Transient);

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "orders.DLT");

    let read_back = DeadLetterRecord::from_delivery(&as_dead_letter_delivery(&published[0].1, 0)).unwrap();
    assert_eq!(read_back.original_channel, "orders");
    assert_eq!(read_back.original_partition, 3);
    assert_eq!(read_back.original_offset, 17);
    assert_eq!(read_back.attempt_count, 3);
    assert_eq!(read_back.failure_message, "Inventory service unavailable");
    assert_eq!(read_back.correlation_id, message.correlation_id);
    assert_eq!(read_back.key.as_deref(), Some("order-1"));
    assert_eq!(read_back.payload, delivery.payload);
}

#[tokio::test]
async fn test_failure_text_is_sanitized_before_publication() {
    let transport = Arc::new(MockTransport::new());
    let router = DeadLetterRouter::new(transport.clone(), "orders.DLT");

    let delivery = order_delivery(&OrderRequest::new("order-2", "lamp", 1), 0, 0);
    let message = InboundMessage::<OrderRequest>::decode(&delivery).unwrap();
    let failure = format!("Login failed password=hunter2 {}", "x".repeat(1000));

    router
        .route(&delivery, &message, FailureKind::Unknown, &failure)
        .await
        .unwrap();

    let published = transport.published();
    let text = published[0]
        .1
        .headers
        .get(headers::DLT_EXCEPTION_MESSAGE)
        .unwrap();
    assert!(!text.contains("hunter2"));
    assert!(text.len() <= 500);
}

#[tokio::test]
async fn test_undecodable_record_keeps_raw_payload() {
    let transport = Arc::new(MockTransport::new());
    let router = DeadLetterRouter::new(transport.clone(), "orders.DLT");

    let delivery = raw_delivery(b"", 5);
    let error = InboundMessage::<OrderRequest>::decode(&delivery).unwrap_err();

    let record = router.route_undecodable(&delivery, &error).await.unwrap();
    assert_eq!(record.reason, DeadLetterReason::Deserialization);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.payload_text(), "<empty>");
    assert_eq!(record.correlation_id, "corr-raw-5");
}

#[tokio::test]
async fn test_undecodable_without_correlation_id_gets_one_assigned() {
    let transport = Arc::new(MockTransport::new());
    let router = DeadLetterRouter::new(transport.clone(), "orders.DLT");

    let delivery = Delivery::new(
        DeliveryPosition::new("orders", 0, 6),
        b"[1,2,3]".to_vec(),
        Default::default(),
    );
    let error = InboundMessage::<OrderRequest>::decode(&delivery).unwrap_err();

    let record = router.route_undecodable(&delivery, &error).await.unwrap();
    assert!(uuid::Uuid::parse_str(&record.correlation_id).is_ok());
}

#[tokio::test]
async fn test_publish_failure_is_reported_once() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_publishes(true);
    let router = DeadLetterRouter::new(transport.clone(), "orders.DLT");

    let delivery = order_delivery(&OrderRequest::new("order-3", "lamp", 1), 0, 0);
    let message = InboundMessage::<OrderRequest>::decode(&delivery).unwrap();

    let result = router
        .route(&delivery, &message, FailureKind::Business, "Invalid quantity: 0")
        .await;

    assert!(matches!(result, Err(DeadLetterError::PublishFailed { .. })));
    assert_eq!(transport.publish_attempts(), 1);
}

#[test]
fn test_record_without_diagnostics_is_rejected() {
    let delivery = raw_delivery(b"{}", 0);
    assert!(DeadLetterRecord::from_delivery(&delivery).is_err());
}
