//! Observability for the order consumer
//!
//! Structured logging, process-wide metrics and the health HTTP endpoint.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{broker_span, dispatch_span, lifecycle_span};
