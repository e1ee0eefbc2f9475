//! Impure I/O operations for MQTT client
//!
//! This module handles network communication, async coordination with the
//! reconnection supervisor, and integration with the rumqttc client.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler, PendingAcks};
use crate::config::BrokerSection;
use crate::observability::metrics::metrics;
use crate::protocol::{
    shared_subscription, validate_channel_name, Delivery, DeliveryPosition, OutboundRecord,
};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request channel between AsyncClient and EventLoop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT v5 transport with manual acknowledgement and shared subscriptions
pub struct MqttClient {
    client_id: String,
    config: BrokerSection,
    partitions: u32,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<std::sync::Mutex<Vec<String>>>,
    forwarder: Arc<MessageForwarder>,
    pending_acks: Arc<PendingAcks>,
}

impl MqttClient {
    /// Create a client; nothing touches the network until [`Transport::connect`]
    ///
    /// `partitions` is the number of logical partitions deliveries are
    /// spread over, one per consumer worker.
    pub fn new(client_id: &str, config: BrokerSection, partitions: u32) -> Result<Self, MqttError> {
        let reconnect_config = ReconnectConfig::for_broker(&config);
        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;

        let (client, event_loop) = Self::create_connection(client_id, &config)?;

        Ok(MqttClient {
            client_id: client_id.to_string(),
            config,
            partitions: partitions.max(1),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config,
            subscribed_topics: Arc::new(std::sync::Mutex::new(Vec::new())),
            forwarder: Arc::new(MessageForwarder::new()),
            pending_acks: Arc::new(PendingAcks::new()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of deliveries handed out and not yet committed
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    fn create_connection(
        client_id: &str,
        config: &BrokerSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for the ConnAck, not just any event
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    // The supervisor keeps retrying an unreachable broker
                    ConnectionState::Disconnected(_)
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    fn check_connection_state(
        &self,
        allowed: fn(&ConnectionState) -> bool,
    ) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: connect() not called".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !allowed(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    fn take_event_loop_handle(&self) -> Option<JoinHandle<()>> {
        self.event_loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Owns the event loop and rebuilds the connection when it drops
struct ConnectionSupervisor {
    client_id: String,
    config: BrokerSection,
    partitions: u32,
    shared_client: Arc<Mutex<AsyncClient>>,
    event_loop: Arc<Mutex<EventLoop>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    reconnect_attempts: u32,
    subscribed_topics: Arc<std::sync::Mutex<Vec<String>>>,
    forwarder: Arc<MessageForwarder>,
    pending_acks: Arc<PendingAcks>,
}

enum SupervisorStep {
    /// Shutdown channel changed; true if the sender is gone
    ShutdownSignal(bool),
    Polled(Result<Event, ConnectionError>),
}

impl ConnectionSupervisor {
    async fn run(mut self) {
        info!(client_id = %self.client_id, "Starting MQTT event loop with reconnection supervisor");

        loop {
            let event_loop = self.event_loop.clone();
            let step = tokio::select! {
                changed = self.shutdown_rx.changed() => SupervisorStep::ShutdownSignal(changed.is_err()),
                polled = async {
                    let mut event_loop_guard = event_loop.lock().await;
                    event_loop_guard.poll().await
                } => SupervisorStep::Polled(polled),
            };

            let keep_running = match step {
                SupervisorStep::ShutdownSignal(closed) => {
                    if !closed && !*self.shutdown_rx.borrow() {
                        continue;
                    }
                    info!("Shutdown signal received, stopping reconnection supervisor");
                    false
                }
                SupervisorStep::Polled(Ok(event)) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.process_event_route(route).await
                }
                SupervisorStep::Polled(Err(e)) => self.handle_event_loop_error(e).await,
            };

            if !keep_running {
                break;
            }
        }

        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.borrow().clone();
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
        let _ = self.state_tx.send(next);
    }

    /// Returns true to keep polling
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.transition(ConnectionEvent::ConnAckReceived);
                metrics().broker_connection_established();
                self.reconnect_attempts = 0;

                // Packet ids from the previous connection are meaningless now
                let dropped = self.pending_acks.clear();
                if dropped > 0 {
                    warn!(
                        dropped = dropped,
                        "Discarded un-acknowledged deliveries from previous connection; broker will redeliver"
                    );
                }
                debug!(session_present = session_present, "ConnAck received");

                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived(publish) => {
                self.handle_message_received(publish).await;
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                metrics().broker_connection_lost();
                self.attempt_reconnection().await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                debug!(target: "mqtt_transport", packet_id = packet_id, "Subscription confirmed: {:?}", return_codes);
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(&mut self, error: ConnectionError) -> bool {
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        if was_connected {
            metrics().broker_connection_lost();
        } else {
            metrics().broker_connection_failed();
        }

        error!(client_id = %self.client_id, error = %error, "MQTT event loop error");
        self.transition(ConnectionEvent::NetworkError(error.to_string()));

        self.attempt_reconnection().await
    }

    async fn handle_message_received(&self, publish: Publish) {
        metrics().message_received();

        if !MessageHandler::should_process_message(&publish) {
            // Still acknowledged, or it would occupy an in-flight slot forever
            let client = self.shared_client.lock().await;
            if let Err(e) = client.ack(&publish).await {
                warn!(error = %e, "Failed to acknowledge retained message");
            }
            return;
        }

        let offset = self.pending_acks.track(publish.clone());
        let delivery = MessageHandler::build_delivery(&publish, offset, self.partitions);
        debug!(target: "mqtt_transport", position = %delivery.position, "Received delivery");

        if let Err(e) = self.forwarder.forward_delivery(delivery).await {
            // Left un-acked; the broker redelivers it in the next session
            self.pending_acks.take(offset);
            error!(error = %e, offset = offset, "Failed to forward delivery");
        }
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self
            .subscribed_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let client = self.shared_client.lock().await;
        for topic in topics {
            if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                error!(topic = %topic, error = %e, "Failed to re-subscribe");
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(delay_ms);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received during reconnection delay, stopping");
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }

    /// Returns true to keep polling with a fresh connection
    async fn attempt_reconnection(&mut self) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                self.apply_new_connection().await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    async fn apply_new_connection(&mut self) {
        metrics().broker_connection_attempt();
        match MqttClient::create_connection(&self.client_id, &self.config) {
            Ok((new_client, new_event_loop)) => {
                self.event_loop = Arc::new(Mutex::new(new_event_loop));
                let mut client_guard = self.shared_client.lock().await;
                *client_guard = new_client;
                debug!("Created new connection for reconnection attempt");
            }
            Err(e) => {
                // Next poll fails again and schedules another attempt
                error!(error = %e, "Failed to create new connection");
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = ConnectionSupervisor {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            partitions: self.partitions,
            shared_client: self.client.clone(),
            event_loop,
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            reconnect_attempts: 0,
            subscribed_topics: self.subscribed_topics.clone(),
            forwarder: self.forwarder.clone(),
            pending_acks: self.pending_acks.clone(),
        };

        let span = crate::broker_span!(client_id = %self.client_id, url = %self.config.url);
        metrics().broker_connection_attempt();

        let handle = tokio::spawn(supervisor.run());
        *self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout)
            .instrument(span)
            .await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to reconnection supervisor");
        }

        let was_connected = self.is_connected();
        if was_connected {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        if let Some(handle) = self.take_event_loop_handle() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Event loop task ended with error");
                }
                Err(_) => warn!("Event loop task didn't shut down in time, aborting"),
                _ => {}
            }
        }

        metrics().broker_connection_lost();
        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        validate_channel_name(channel)?;
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        let topic = shared_subscription(&self.config.group, channel);
        {
            let client = self.client.lock().await;
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        }

        let mut topics = self
            .subscribed_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !topics.contains(&topic) {
            topics.push(topic.clone());
        }

        info!(topic = %topic, "Subscribed to channel");
        Ok(())
    }

    /// Resolves once the record is queued to the event loop; the broker's
    /// PUBACK is handled by rumqttc
    async fn publish(&self, channel: &str, record: &OutboundRecord) -> Result<(), Self::Error> {
        self.check_connection_state(HealthMonitor::can_publish)?;

        let properties = MessageHandler::build_publish_properties(record);
        let client = self.client.lock().await;
        let result = client
            .publish_with_properties(
                channel,
                QoS::AtLeastOnce,
                false,
                record.payload.clone(),
                properties,
            )
            .await;

        match result {
            Ok(()) => {
                metrics().message_published();
                Ok(())
            }
            Err(e) => {
                metrics().publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    async fn commit(&self, position: &DeliveryPosition) -> Result<(), Self::Error> {
        let Some(publish) = self.pending_acks.take(position.offset) else {
            debug!(position = %position, "Commit for unknown offset ignored");
            return Ok(());
        };

        self.check_connection_state(HealthMonitor::can_publish)
            .map_err(|e| MqttError::CommitFailed(Box::new(e)))?;

        let client = self.client.lock().await;
        client
            .ack(&publish)
            .await
            .map_err(|e| MqttError::CommitFailed(Box::new(e)))
    }

    fn set_delivery_sender(&self, sender: mpsc::Sender<Delivery>) {
        self.forwarder.set_delivery_sender(sender);
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Drop cannot await; callers wanting a clean DISCONNECT call disconnect()
        if let Some(handle) = self.take_event_loop_handle() {
            handle.abort();
        }
    }
}
