//! Order processing core
//!
//! Idempotency guard, failure classifier, retry policy, dead-letter router
//! and the dispatcher tying them together around a business handler.

pub mod classifier;
pub mod dead_letter;
pub mod dispatcher;
pub mod handler;
pub mod idempotency;
pub mod retry;

pub use classifier::{classify, FailureKind, ProcessingOutcome};
pub use dead_letter::{DeadLetterError, DeadLetterRouter};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use handler::{Handler, HandlerError, LoggingOrderSink, OrderHandler, OrderSink};
pub use idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
