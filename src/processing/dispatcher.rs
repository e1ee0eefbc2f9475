//! Consumption dispatcher
//!
//! Drives one delivery through its state machine:
//!
//! ```text
//! Received -> Processing -> Committed
//!                |  ^
//!                v  |
//!              Retrying -> DeadLettered
//! ```
//!
//! A delivery is committed only once its outcome is final: after the
//! handler succeeded, or after the dead-letter record was published. Nothing
//! is committed while a retry is pending, so a crash mid-retry leads to
//! redelivery from the channel.

use crate::observability::metrics::metrics;
use crate::processing::classifier::{classify, FailureKind};
use crate::processing::dead_letter::{DeadLetterError, DeadLetterRouter};
use crate::processing::handler::Handler;
use crate::processing::retry::{RetryDecision, RetryPolicy};
use crate::protocol::{DeadLetterReason, Delivery, DeliveryPosition, InboundMessage};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Terminal result of dispatching one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded and the delivery was committed
    Committed { attempts: u32 },
    /// Delivery was published to the dead-letter channel and committed
    DeadLettered {
        attempts: u32,
        reason: DeadLetterReason,
    },
    /// Shutdown arrived during a retry wait; the delivery was not committed
    Abandoned { attempts: u32 },
}

impl DispatchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Committed { attempts }
            | DispatchOutcome::DeadLettered { attempts, .. }
            | DispatchOutcome::Abandoned { attempts } => *attempts,
        }
    }
}

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The outcome was final but the commit did not go through; the channel
    /// will redeliver and the idempotency guard absorbs the repeat
    #[error("Failed to commit {position}: {source}")]
    Commit {
        position: DeliveryPosition,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The dead-letter record could not be published
    #[error("Dead-letter routing failed: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

impl DispatchError {
    /// Whether the consumer must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::DeadLetter(_))
    }
}

enum DispatchState<E> {
    Received,
    Processing(InboundMessage<E>),
    Retrying {
        message: InboundMessage<E>,
        delay: Duration,
    },
    DeadLettering {
        message: InboundMessage<E>,
        kind: FailureKind,
        failure: String,
    },
    Committing(DispatchOutcome),
}

/// Runs deliveries through handler, classifier, retry policy and
/// dead-letter router
pub struct Dispatcher<H: Handler, T: Transport> {
    handler: Arc<H>,
    policy: RetryPolicy,
    dead_letters: DeadLetterRouter<T>,
    transport: Arc<T>,
}

impl<H: Handler, T: Transport> Dispatcher<H, T> {
    pub fn new(
        handler: Arc<H>,
        policy: RetryPolicy,
        transport: Arc<T>,
        dead_letter_channel: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            policy,
            dead_letters: DeadLetterRouter::new(transport.clone(), dead_letter_channel),
            transport,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch one delivery to a terminal outcome
    ///
    /// `shutdown` interrupts retry waits; the handler itself is never
    /// cancelled mid-invocation.
    pub async fn dispatch(
        &self,
        delivery: &Delivery,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let span = crate::dispatch_span!(
            channel = %delivery.position.channel,
            partition = delivery.position.partition,
            offset = delivery.position.offset,
            correlation_id = delivery.correlation_id().unwrap_or("-")
        );

        self.run(delivery, shutdown).instrument(span).await
    }

    async fn run(
        &self,
        delivery: &Delivery,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        metrics().delivery_received();

        let mut state = DispatchState::Received;
        loop {
            state = match state {
                DispatchState::Received => self.decode(delivery).await?,
                DispatchState::Processing(message) => self.process(message).await,
                DispatchState::Retrying { message, delay } => {
                    if !Self::interruptible_sleep(shutdown.clone(), delay).await {
                        let attempts = message.attempts_made();
                        metrics().delivery_abandoned();
                        info!(
                            correlation_id = %message.correlation_id,
                            attempts,
                            "Shutdown during retry wait, leaving delivery uncommitted"
                        );
                        return Ok(DispatchOutcome::Abandoned { attempts });
                    }
                    DispatchState::Processing(message.next_attempt())
                }
                DispatchState::DeadLettering {
                    message,
                    kind,
                    failure,
                } => {
                    let record = self
                        .dead_letters
                        .route(delivery, &message, kind, &failure)
                        .await?;
                    DispatchState::Committing(DispatchOutcome::DeadLettered {
                        attempts: record.attempt_count,
                        reason: record.reason,
                    })
                }
                DispatchState::Committing(outcome) => {
                    self.commit(&delivery.position).await?;
                    metrics().record_processing_time(started.elapsed());
                    return Ok(outcome);
                }
            };
        }
    }

    async fn decode(&self, delivery: &Delivery) -> Result<DispatchState<H::Event>, DispatchError> {
        match InboundMessage::<H::Event>::decode(delivery) {
            Ok(message) => Ok(DispatchState::Processing(message)),
            Err(e) => {
                warn!(error = %e, "Undecodable payload, routing to dead-letter channel");
                let record = self.dead_letters.route_undecodable(delivery, &e).await?;
                Ok(DispatchState::Committing(DispatchOutcome::DeadLettered {
                    attempts: record.attempt_count,
                    reason: record.reason,
                }))
            }
        }
    }

    async fn process(&self, message: InboundMessage<H::Event>) -> DispatchState<H::Event> {
        debug!(
            attempt = message.attempt,
            entity_id = %message.entity_id(),
            "Invoking handler"
        );

        let error = match self.handler.handle(&message).await {
            Ok(()) => {
                return DispatchState::Committing(DispatchOutcome::Committed {
                    attempts: message.attempts_made(),
                });
            }
            Err(e) => e,
        };

        let kind = classify(&error);
        let failure = error.to_string();
        metrics().failure_recorded(kind);

        match self.policy.decide(kind, message.attempts_made()) {
            RetryDecision::RetryAfter(delay) => {
                metrics().retry_scheduled();
                warn!(
                    attempt = message.attempt,
                    kind = %kind,
                    error = %failure,
                    delay_ms = delay.as_millis() as u64,
                    "Handler failed, retrying"
                );
                DispatchState::Retrying { message, delay }
            }
            RetryDecision::GiveUp => {
                warn!(
                    attempt = message.attempt,
                    kind = %kind,
                    error = %failure,
                    "Handler failed, giving up"
                );
                DispatchState::DeadLettering {
                    message,
                    kind,
                    failure,
                }
            }
        }
    }

    async fn commit(&self, position: &DeliveryPosition) -> Result<(), DispatchError> {
        match self.transport.commit(position).await {
            Ok(()) => {
                metrics().delivery_committed();
                debug!("Delivery committed");
                Ok(())
            }
            Err(e) => {
                metrics().commit_failed();
                error!(error = %e, "Failed to commit delivery");
                Err(DispatchError::Commit {
                    position: position.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Sleep for `delay` unless shutdown is signalled first
    /// Returns false if shutdown was requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }
}
