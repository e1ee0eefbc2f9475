//! Partition workers and the router feeding them
//!
//! Each worker owns one bounded queue and dispatches its deliveries strictly
//! one at a time, so a delivery that is still retrying holds back every later
//! delivery of the same partition. The router never waits on a full queue:
//! it parks the overflow per partition and keeps feeding the others.

use crate::observability::health::HealthServer;
use crate::processing::dispatcher::{DispatchOutcome, Dispatcher};
use crate::processing::handler::Handler;
use crate::protocol::Delivery;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Its queue was closed and drained
    Drained,
    /// Shutdown was signalled
    Shutdown,
    /// A fatal dispatch error; the consumer must stop
    Fatal(String),
}

/// Deliveries the router may hold across all partitions before it stops
/// reading from the transport
pub const ROUTER_BACKLOG_LIMIT: usize = 1024;

/// How often parked deliveries are offered to their worker again
const BACKLOG_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Queue index serving a partition
pub fn worker_index(partition: u32, workers: usize) -> usize {
    if workers == 0 {
        return 0;
    }
    partition as usize % workers
}

/// Processes the deliveries of one partition in arrival order
pub struct PartitionWorker<H: Handler, T: Transport> {
    id: usize,
    dispatcher: Arc<Dispatcher<H, T>>,
    queue: mpsc::Receiver<Delivery>,
    shutdown: watch::Receiver<bool>,
    fatal: Arc<watch::Sender<Option<String>>>,
    health_server: Option<Arc<HealthServer>>,
}

impl<H: Handler + 'static, T: Transport + 'static> PartitionWorker<H, T> {
    pub fn new(
        id: usize,
        dispatcher: Arc<Dispatcher<H, T>>,
        queue: mpsc::Receiver<Delivery>,
        shutdown: watch::Receiver<bool>,
        fatal: Arc<watch::Sender<Option<String>>>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            queue,
            shutdown,
            fatal,
            health_server: None,
        }
    }

    pub fn with_health_server(mut self, health_server: Option<Arc<HealthServer>>) -> Self {
        self.health_server = health_server;
        self
    }

    /// Run until shutdown, queue closure or a fatal error
    pub async fn run(mut self) -> WorkerExit {
        debug!(worker = self.id, "Partition worker started");

        let exit = loop {
            if *self.shutdown.borrow() {
                break WorkerExit::Shutdown;
            }

            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break WorkerExit::Shutdown;
                    }
                    continue;
                }
                next = self.queue.recv() => next,
            };

            let Some(delivery) = next else {
                break WorkerExit::Drained;
            };

            if let Some(exit) = self.dispatch(delivery).await {
                break exit;
            }
        };

        match &exit {
            WorkerExit::Fatal(reason) => {
                error!(worker = self.id, reason = %reason, "Partition worker stopped on fatal error");
            }
            other => debug!(worker = self.id, exit = ?other, "Partition worker stopped"),
        }
        exit
    }

    /// Returns Some when the worker must stop
    async fn dispatch(&self, delivery: Delivery) -> Option<WorkerExit> {
        match self.dispatcher.dispatch(&delivery, &self.shutdown).await {
            Ok(DispatchOutcome::Abandoned { .. }) => Some(WorkerExit::Shutdown),
            Ok(outcome) => {
                if let Some(health_server) = &self.health_server {
                    health_server.mark_delivery_committed();
                }
                debug!(worker = self.id, position = %delivery.position, outcome = ?outcome, "Delivery finished");
                None
            }
            Err(e) if e.is_fatal() => {
                let reason = format!("{} at {}", e, delivery.position);
                self.fatal.send_replace(Some(reason.clone()));
                Some(WorkerExit::Fatal(reason))
            }
            Err(e) => {
                warn!(
                    worker = self.id,
                    position = %delivery.position,
                    error = %e,
                    "Delivery outcome not committed; the channel will redeliver it"
                );
                None
            }
        }
    }
}

/// Fan deliveries out to the worker owning their partition
///
/// A partition whose queue is full gets its deliveries parked in arrival
/// order; the other partitions keep flowing. Parked deliveries still pending
/// at shutdown stay uncommitted and are redelivered.
pub async fn route_deliveries(
    mut inbound: mpsc::Receiver<Delivery>,
    workers: Vec<mpsc::Sender<Delivery>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if workers.is_empty() {
        error!("No partition workers to route deliveries to");
        return;
    }

    let mut backlog: Vec<VecDeque<Delivery>> = workers.iter().map(|_| VecDeque::new()).collect();
    let mut inbound_open = true;

    loop {
        if *shutdown.borrow() {
            break;
        }

        flush_backlog(&workers, &mut backlog);
        let parked: usize = backlog.iter().map(VecDeque::len).sum();
        if !inbound_open && parked == 0 {
            break;
        }

        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            next = inbound.recv(), if inbound_open && parked < ROUTER_BACKLOG_LIMIT => {
                match next {
                    Some(delivery) => route_one(&workers, &mut backlog, delivery),
                    None => inbound_open = false,
                }
            }
            _ = tokio::time::sleep(BACKLOG_RETRY_INTERVAL), if parked > 0 => {}
        }
    }

    let parked: usize = backlog.iter().map(VecDeque::len).sum();
    if parked > 0 {
        info!(parked = parked, "Parked deliveries left uncommitted for redelivery");
    }
    info!("Delivery router stopped");
}

fn route_one(
    workers: &[mpsc::Sender<Delivery>],
    backlog: &mut [VecDeque<Delivery>],
    delivery: Delivery,
) {
    let index = worker_index(delivery.position.partition, workers.len());

    // Anything already parked for this partition goes first
    if !backlog[index].is_empty() {
        backlog[index].push_back(delivery);
        return;
    }

    match workers[index].try_send(delivery) {
        Ok(()) => {}
        Err(TrySendError::Full(delivery)) => {
            debug!(worker = index, position = %delivery.position, "Partition queue full, parking delivery");
            backlog[index].push_back(delivery);
        }
        Err(TrySendError::Closed(delivery)) => {
            // Worker gone; the delivery stays uncommitted and is redelivered
            warn!(worker = index, position = %delivery.position, "Partition worker stopped, delivery left for redelivery");
        }
    }
}

fn flush_backlog(workers: &[mpsc::Sender<Delivery>], backlog: &mut [VecDeque<Delivery>]) {
    for (index, parked) in backlog.iter_mut().enumerate() {
        while let Some(delivery) = parked.pop_front() {
            match workers[index].try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(delivery)) => {
                    parked.push_front(delivery);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        worker = index,
                        dropped = parked.len() + 1,
                        "Partition worker stopped, parked deliveries left for redelivery"
                    );
                    parked.clear();
                }
            }
        }
    }
}
