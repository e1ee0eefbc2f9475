//! Consumer lifecycle management
//!
//! Brings the transport up, starts one worker per partition behind a
//! delivery router, and tears everything down again on shutdown.

use super::worker::{route_deliveries, PartitionWorker, WorkerExit};
use crate::config::RelayConfig;
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::processing::dispatcher::Dispatcher;
use crate::processing::handler::Handler;
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// How often the connection monitor samples the transport
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer states reported through metrics
pub mod states {
    pub const CREATED: &str = "created";
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const STOPPING: &str = "stopping";
    pub const STOPPED: &str = "stopped";
    pub const FAILED: &str = "failed";
}

/// Runs the consumer: transport, router, partition workers
pub struct ConsumerLifecycle<T, H>
where
    T: Transport + 'static,
    H: Handler + 'static,
{
    config: RelayConfig,
    transport: Option<T>,
    running_transport: Option<Arc<T>>,
    handler: Arc<H>,
    health_server: Option<Arc<HealthServer>>,
    shutdown_tx: watch::Sender<bool>,
    fatal_tx: Arc<watch::Sender<Option<String>>>,
    fatal_rx: watch::Receiver<Option<String>>,
    router_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<WorkerExit>>,
}

impl<T, H> ConsumerLifecycle<T, H>
where
    T: Transport + 'static,
    H: Handler + 'static,
{
    pub fn new(config: RelayConfig, transport: T, handler: Arc<H>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        metrics().set_consumer_state(states::CREATED);

        Self {
            config,
            transport: Some(transport),
            running_transport: None,
            handler,
            health_server: None,
            shutdown_tx,
            fatal_tx: Arc::new(fatal_tx),
            fatal_rx,
            router_handle: None,
            monitor_handle: None,
            worker_handles: Vec::new(),
        }
    }

    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    /// The connected transport, once started
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.running_transport.as_ref()
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handles.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Connect, subscribe and start the workers
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(
            group = %self.config.broker.group,
            channel = %self.config.channels.main
        );
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), LifecycleError> {
        self.config.validate()?;
        let mut transport = self.transport.take().ok_or(LifecycleError::AlreadyStarted)?;

        metrics().set_consumer_state(states::STARTING);
        info!("Starting order consumer");

        if let Err(e) = transport.connect().await {
            metrics().set_consumer_state(states::FAILED);
            return Err(LifecycleError::TransportError(Box::new(e)));
        }
        info!("Broker transport connected");

        let queue_capacity = self.config.consumer.queue_capacity.max(1);
        let (delivery_tx, delivery_rx) = mpsc::channel(queue_capacity);
        transport.set_delivery_sender(delivery_tx);

        if let Err(e) = transport.subscribe(&self.config.channels.main).await {
            metrics().set_consumer_state(states::FAILED);
            let _ = transport.disconnect().await;
            return Err(LifecycleError::TransportError(Box::new(e)));
        }

        let transport = Arc::new(transport);
        let dispatcher = Arc::new(Dispatcher::new(
            self.handler.clone(),
            self.config.retry_policy(),
            transport.clone(),
            self.config.channels.dead_letter.clone(),
        ));

        let partitions = self.config.consumer.partitions.max(1) as usize;
        let mut worker_queues = Vec::with_capacity(partitions);
        for id in 0..partitions {
            let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
            worker_queues.push(queue_tx);

            let worker = PartitionWorker::new(
                id,
                dispatcher.clone(),
                queue_rx,
                self.shutdown_tx.subscribe(),
                self.fatal_tx.clone(),
            )
            .with_health_server(self.health_server.clone());
            self.worker_handles.push(tokio::spawn(worker.run().in_current_span()));
        }

        self.router_handle = Some(tokio::spawn(
            route_deliveries(delivery_rx, worker_queues, self.shutdown_tx.subscribe())
                .in_current_span(),
        ));

        self.monitor_handle = Some(Self::spawn_connection_monitor(
            transport.clone(),
            self.health_server.clone(),
            self.fatal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        if let Some(health_server) = &self.health_server {
            health_server.set_broker_connected(transport.is_connected());
            health_server.set_consumer_running(true);
        }
        metrics().set_consumer_state(states::RUNNING);
        metrics().update_health_status(true);

        self.running_transport = Some(transport);
        info!(
            partitions = partitions,
            dead_letter_channel = %self.config.channels.dead_letter,
            max_attempts = self.config.retry.max_attempts,
            "Order consumer started"
        );
        Ok(())
    }

    /// Mirror the broker connection into health and metrics; a permanent
    /// disconnect is fatal
    fn spawn_connection_monitor(
        transport: Arc<T>,
        health_server: Option<Arc<HealthServer>>,
        fatal: Arc<watch::Sender<Option<String>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CONNECTION_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let connected = transport.is_connected();
                        if let Some(health_server) = &health_server {
                            health_server.set_broker_connected(connected);
                        }
                        metrics().update_health_status(connected);

                        if transport.is_permanently_disconnected() {
                            let reason = format!(
                                "Broker connection permanently lost: {:?}",
                                transport.connection_state()
                            );
                            fatal.send_replace(Some(reason));
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Resolves with the reason once the consumer can no longer make progress
    pub fn wait_for_fatal(&self) -> impl Future<Output = String> + Send + 'static {
        let mut fatal_rx = self.fatal_rx.clone();
        async move {
            loop {
                let current = fatal_rx.borrow_and_update().clone();
                if let Some(reason) = current {
                    return reason;
                }
                if fatal_rx.changed().await.is_err() {
                    return "Consumer stopped without reporting a reason".to_string();
                }
            }
        }
    }

    /// The fatal reason, if one was reported
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_rx.borrow().clone()
    }

    /// Stop the workers, wait up to the grace period, then disconnect
    ///
    /// Retry waits in progress are abandoned; their deliveries stay
    /// uncommitted and are redelivered by the broker.
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        info!("Shutting down order consumer");
        metrics().set_consumer_state(states::STOPPING);
        if let Some(health_server) = &self.health_server {
            health_server.set_consumer_running(false);
        }

        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let mut forced = 0usize;
        for handle in self.worker_handles.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(exit)) => {
                    if let WorkerExit::Fatal(reason) = exit {
                        warn!(reason = %reason, "Worker had stopped on a fatal error");
                    }
                }
                Ok(Err(e)) if !e.is_cancelled() => error!(error = %e, "Worker task failed"),
                Ok(Err(_)) => {}
                Err(_) => {
                    abort.abort();
                    forced += 1;
                }
            }
        }
        if forced > 0 {
            warn!(forced = forced, "Workers did not stop within the grace period and were aborted");
        }

        for handle in [self.router_handle.take(), self.monitor_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }

        let disconnect_result = match self.running_transport.take() {
            Some(transport) => transport.disconnect().await,
            None => Ok(()),
        };

        if let Some(health_server) = &self.health_server {
            health_server.set_broker_connected(false);
        }
        metrics().update_health_status(false);

        match disconnect_result {
            Ok(()) => {
                metrics().set_consumer_state(states::STOPPED);
                info!("Order consumer shutdown complete");
                Ok(())
            }
            Err(e) => {
                metrics().set_consumer_state(states::FAILED);
                Err(LifecycleError::ShutdownError(format!(
                    "Failed to disconnect from broker: {e}"
                )))
            }
        }
    }

    /// Check if the transport connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        match (&self.transport, &self.running_transport) {
            (Some(transport), _) => transport.is_permanently_disconnected(),
            (None, Some(transport)) => transport.is_permanently_disconnected(),
            (None, None) => false,
        }
    }
}

/// Consumer lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error")]
    ConfigurationError(#[source] crate::config::ConfigError),
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Consumer already started")]
    AlreadyStarted,
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl From<crate::config::ConfigError> for LifecycleError {
    fn from(err: crate::config::ConfigError) -> Self {
        LifecycleError::ConfigurationError(err)
    }
}
