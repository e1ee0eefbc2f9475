//! Mock implementations for testing
//!
//! Provides an in-memory Transport, a scripted business handler and a
//! recording order sink, so the dispatcher and consumer can be exercised
//! without a broker.

use crate::error::RelayError;
use crate::processing::handler::{Handler, HandlerError, OrderSink};
use crate::protocol::{Delivery, DeliveryPosition, InboundMessage, OrderRequest, OutboundRecord};
use crate::transport::{mqtt::ConnectionState, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub type PublishedRecord = (String, OutboundRecord);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory transport recording commits and publications
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    fail_connect: bool,
    fail_publishes: AtomicBool,
    fail_commits: AtomicBool,
    publish_attempts: AtomicUsize,
    published: Mutex<Vec<PublishedRecord>>,
    commits: Mutex<Vec<DeliveryPosition>>,
    subscriptions: Mutex<Vec<String>>,
    delivery_sender: Mutex<Option<mpsc::Sender<Delivery>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose `connect` always fails
    pub fn with_connect_failure() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Successful publications, in order
    pub fn published(&self) -> Vec<PublishedRecord> {
        lock(&self.published).clone()
    }

    /// Publications attempted, including failed ones
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Committed positions, in commit order
    pub fn commits(&self) -> Vec<DeliveryPosition> {
        lock(&self.commits).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    /// Push a delivery to the consumer as the broker would
    ///
    /// Returns false if no consumer is attached or it has gone away.
    pub async fn deliver(&self, delivery: Delivery) -> bool {
        let sender = lock(&self.delivery_sender).clone();
        match sender {
            Some(sender) => sender.send(delivery).await.is_ok(),
            None => false,
        }
    }

    /// Wait until at least `count` commits were recorded
    pub async fn wait_for_commits(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if lock(&self.commits).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        lock(&self.commits).len() >= count
    }

    pub fn clear_history(&self) {
        lock(&self.published).clear();
        lock(&self.commits).clear();
        self.publish_attempts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = RelayError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.fail_connect {
            return Err(RelayError::internal_error("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        lock(&self.subscriptions).push(channel.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, record: &OutboundRecord) -> Result<(), Self::Error> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(RelayError::internal_error("Mock publish failure"));
        }
        lock(&self.published).push((channel.to_string(), record.clone()));
        Ok(())
    }

    async fn commit(&self, position: &DeliveryPosition) -> Result<(), Self::Error> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(RelayError::internal_error("Mock commit failure"));
        }
        lock(&self.commits).push(position.clone());
        Ok(())
    }

    fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>) {
        *lock(&self.delivery_sender) = Some(sender);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        Some(if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("Mock transport not connected".to_string())
        })
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }
}

/// What a [`ScriptedHandler`] does on one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedStep {
    Succeed,
    FailBusiness,
    FailTransient,
    FailUnexpected,
}

impl ScriptedStep {
    fn into_result(self, order_id: &str) -> Result<(), HandlerError> {
        match self {
            ScriptedStep::Succeed => Ok(()),
            ScriptedStep::FailBusiness => Err(HandlerError::business(format!(
                "Scripted rejection of {order_id}"
            ))),
            ScriptedStep::FailTransient => Err(HandlerError::transient(format!(
                "Scripted outage while processing {order_id}"
            ))),
            ScriptedStep::FailUnexpected => Err(HandlerError::unexpected(std::io::Error::other(
                format!("Scripted crash while processing {order_id}"),
            ))),
        }
    }
}

/// Handler that follows a script instead of business rules
///
/// Steps are consumed one per invocation across all messages; once the
/// script runs out the fallback applies. Per-order overrides win over both.
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<Vec<ScriptedStep>>,
    fallback: ScriptedStep,
    per_order: HashMap<String, ScriptedStep>,
    delay: Option<Duration>,
    invocations: AtomicUsize,
    seen_attempts: Mutex<Vec<u32>>,
    seen_orders: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    pub fn always(step: ScriptedStep) -> Self {
        Self::sequence(Vec::new(), step)
    }

    /// Run `steps` in order, then `then` forever
    pub fn sequence(steps: Vec<ScriptedStep>, then: ScriptedStep) -> Self {
        let mut script = steps;
        script.reverse();
        Self {
            script: Mutex::new(script),
            fallback: then,
            per_order: HashMap::new(),
            delay: None,
            invocations: AtomicUsize::new(0),
            seen_attempts: Mutex::new(Vec::new()),
            seen_orders: Mutex::new(Vec::new()),
        }
    }

    /// Always apply `step` to one order id
    pub fn with_order_step(mut self, order_id: impl Into<String>, step: ScriptedStep) -> Self {
        self.per_order.insert(order_id.into(), step);
        self
    }

    /// Sleep this long inside every invocation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Attempt counter of every invocation, in call order
    pub fn seen_attempts(&self) -> Vec<u32> {
        lock(&self.seen_attempts).clone()
    }

    /// Order id of every invocation, in call order
    pub fn seen_orders(&self) -> Vec<String> {
        lock(&self.seen_orders).clone()
    }

    fn next_step(&self, order_id: &str) -> ScriptedStep {
        let scripted = lock(&self.script).pop().unwrap_or(self.fallback);
        self.per_order.get(order_id).copied().unwrap_or(scripted)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    type Event = OrderRequest;

    async fn handle(&self, message: &InboundMessage<OrderRequest>) -> Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen_attempts).push(message.attempt);
        lock(&self.seen_orders).push(message.payload.order_id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.next_step(&message.payload.order_id)
            .into_result(&message.payload.order_id)
    }
}

/// Order sink recording every applied order
#[derive(Debug, Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<(OrderRequest, String)>>,
    unready_checks: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` readiness checks with a transient error
    pub fn fail_ready_checks(&self, times: usize) {
        self.unready_checks.store(times, Ordering::SeqCst);
    }

    /// Applied orders with their correlation ids
    pub fn applied(&self) -> Vec<(OrderRequest, String)> {
        lock(&self.applied).clone()
    }

    pub fn applied_count(&self) -> usize {
        lock(&self.applied).len()
    }
}

#[async_trait]
impl OrderSink for RecordingSink {
    async fn ensure_ready(&self) -> Result<(), HandlerError> {
        let remaining = self
            .unready_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(HandlerError::transient("Inventory service unavailable")),
            Err(_) => Ok(()),
        }
    }

    async fn apply(&self, order: &OrderRequest, correlation_id: &str) {
        lock(&self.applied).push((order.clone(), correlation_id.to_string()));
    }
}
