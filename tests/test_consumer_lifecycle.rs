//! Consumer lifecycle tests
//!
//! Runs the full consumer (router, partition workers, dispatcher) against
//! the in-memory transport:
//! - Startup and shutdown
//! - Per-partition ordering with a retrying head delivery
//! - Other partitions flowing while one partition's queue is full
//! - Fatal dead-letter failures
//! - Abandoning retry waits on shutdown

mod test_helpers;

use orderguard::consumer::{ConsumerLifecycle, LifecycleError};
use orderguard::observability::health::HealthServer;
use orderguard::protocol::{DeliveryPosition, OrderRequest};
use orderguard::testing::{MockTransport, ScriptedHandler, ScriptedStep};
use orderguard::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::{order_delivery, test_config};

const WAIT: Duration = Duration::from_secs(5);

async fn started(
    handler: ScriptedHandler,
    transport: MockTransport,
) -> (
    ConsumerLifecycle<MockTransport, ScriptedHandler>,
    Arc<MockTransport>,
    Arc<ScriptedHandler>,
) {
    let handler = Arc::new(handler);
    let mut consumer = ConsumerLifecycle::new(test_config(), transport, handler.clone());
    consumer.start().await.expect("consumer should start");
    let transport = consumer.transport().expect("transport after start").clone();
    (consumer, transport, handler)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_consumer_commits_successful_orders() {
    let (mut consumer, transport, handler) =
        started(ScriptedHandler::always(ScriptedStep::Succeed), MockTransport::new()).await;

    assert_eq!(transport.subscriptions(), vec!["orders".to_string()]);

    for offset in 0..4 {
        let order = OrderRequest::new(format!("order-{offset}"), "lamp", 1);
        assert!(transport.deliver(order_delivery(&order, (offset % 2) as u32, offset)).await);
    }

    assert!(transport.wait_for_commits(4, WAIT).await);
    assert_eq!(handler.invocations(), 4);
    assert!(transport.published().is_empty());

    consumer.shutdown().await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_retrying_delivery_holds_back_its_partition_only() {
    let handler = ScriptedHandler::always(ScriptedStep::Succeed)
        .with_order_step("order-A", ScriptedStep::FailTransient);
    let (mut consumer, transport, _handler) = started(handler, MockTransport::new()).await;

    let a = order_delivery(&OrderRequest::new("order-A", "lamp", 1), 0, 0);
    let b = order_delivery(&OrderRequest::new("order-B", "lamp", 1), 0, 1);
    let c = order_delivery(&OrderRequest::new("order-C", "lamp", 1), 1, 2);
    transport.deliver(a.clone()).await;
    transport.deliver(b.clone()).await;
    transport.deliver(c.clone()).await;

    assert!(transport.wait_for_commits(3, WAIT).await);

    let commits = transport.commits();
    let index_of = |position: &DeliveryPosition| {
        commits
            .iter()
            .position(|committed| committed == position)
            .expect("position committed")
    };
    assert!(index_of(&a.position) < index_of(&b.position));
    // The other partition is not blocked by the retry waits
    assert!(index_of(&c.position) < index_of(&a.position));

    // A was dead-lettered after exhausting its retries
    assert_eq!(transport.published().len(), 1);

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_partition_queue_does_not_stall_other_partitions() {
    let mut config = test_config();
    config.consumer.queue_capacity = 1;
    config.retry.delay_ms = 2_000;
    let handler = Arc::new(
        ScriptedHandler::always(ScriptedStep::Succeed)
            .with_order_step("order-A", ScriptedStep::FailTransient),
    );
    let mut consumer = ConsumerLifecycle::new(config, MockTransport::new(), handler.clone());
    consumer.start().await.unwrap();
    let transport = consumer.transport().unwrap().clone();

    for (offset, order_id) in ["order-A", "order-B", "order-C", "order-D", "order-F"]
        .into_iter()
        .enumerate()
    {
        let order = OrderRequest::new(order_id, "lamp", 1);
        assert!(transport.deliver(order_delivery(&order, 0, offset as u64)).await);
    }
    let other = order_delivery(&OrderRequest::new("order-E", "lamp", 1), 1, 5);
    assert!(transport.deliver(other.clone()).await);

    // Partition 0 is waiting out its first retry delay
    assert!(transport.wait_for_commits(1, Duration::from_millis(1_500)).await);
    assert_eq!(transport.commits(), vec![other.position]);

    consumer.shutdown().await.unwrap();
    assert_eq!(transport.commits().len(), 1);
}

#[tokio::test]
async fn test_dead_letter_publish_failure_is_fatal() {
    let transport = MockTransport::new();
    transport.fail_publishes(true);
    let (mut consumer, transport, _handler) =
        started(ScriptedHandler::always(ScriptedStep::FailBusiness), transport).await;

    transport
        .deliver(order_delivery(&OrderRequest::new("order-1", "lamp", 1), 0, 0))
        .await;

    let reason = tokio::time::timeout(WAIT, consumer.wait_for_fatal())
        .await
        .expect("fatal reason should be reported");
    assert!(reason.contains("Dead-letter"));
    assert_eq!(consumer.fatal_reason(), Some(reason));
    assert!(transport.commits().is_empty());

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_abandons_retry_wait_without_commit() {
    let mut config = test_config();
    config.retry.delay_ms = 30_000;
    let handler = Arc::new(ScriptedHandler::always(ScriptedStep::FailTransient));
    let mut consumer = ConsumerLifecycle::new(config, MockTransport::new(), handler.clone());
    consumer.start().await.unwrap();
    let transport = consumer.transport().unwrap().clone();

    transport
        .deliver(order_delivery(&OrderRequest::new("order-1", "lamp", 1), 0, 0))
        .await;
    assert!(wait_until(|| handler.invocations() == 1).await);

    let started = Instant::now();
    consumer.shutdown().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(transport.commits().is_empty());
    assert!(transport.published().is_empty());
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn test_connect_failure_prevents_start() {
    let handler = Arc::new(ScriptedHandler::always(ScriptedStep::Succeed));
    let mut consumer =
        ConsumerLifecycle::new(test_config(), MockTransport::with_connect_failure(), handler);

    let result = consumer.start().await;
    assert!(matches!(result, Err(LifecycleError::TransportError(_))));
    assert!(consumer.transport().is_none());
}

#[tokio::test]
async fn test_health_server_tracks_consumer_state() {
    let handler = Arc::new(ScriptedHandler::always(ScriptedStep::Succeed));
    let health_server = Arc::new(HealthServer::new("order-group-consumer", 0));
    let mut consumer = ConsumerLifecycle::new(test_config(), MockTransport::new(), handler);
    consumer.set_health_server(health_server.clone());

    assert!(!health_server.is_ready());

    consumer.start().await.unwrap();
    assert!(consumer.is_running());
    assert!(health_server.is_ready());

    consumer.shutdown().await.unwrap();
    assert!(!consumer.is_running());
    assert!(!health_server.is_ready());
}
