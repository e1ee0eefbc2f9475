//! Health check HTTP server for container orchestration
//!
//! Exposes `/health`, `/ready`, `/live` and `/metrics` for operators and
//! orchestration platforms.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// No committed delivery for this long marks the consumer as idle
const DELIVERY_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    service_name: String,
    port: u16,
    broker_connected: Arc<AtomicBool>,
    consumer_running: Arc<AtomicBool>,
    last_delivery_committed: Arc<AtomicU64>,
}

impl HealthServer {
    pub fn new(service_name: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            broker_connected: Arc::new(AtomicBool::new(false)),
            consumer_running: Arc::new(AtomicBool::new(false)),
            last_delivery_committed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_consumer_running(&self, running: bool) {
        self.consumer_running.store(running, Ordering::Relaxed);
    }

    /// Record that a delivery reached a terminal outcome now
    pub fn mark_delivery_committed(&self) {
        self.last_delivery_committed
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Ready once the broker is connected and the consumer is running
    pub fn is_ready(&self) -> bool {
        self.broker_connected.load(Ordering::Relaxed) && self.consumer_running.load(Ordering::Relaxed)
    }

    /// Start the HTTP health server; runs until the process exits
    pub async fn start(self: Arc<Self>) {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with individual checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - metrics snapshot as JSON
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        let routes = health_route.or(metrics_route).or(ready_route).or(live_route);

        tracing::info!(port = self.port, "Starting health server");

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();

        let mut checks = BTreeMap::new();
        checks.insert("broker".to_string(), self.check_broker(now));
        checks.insert("consumer".to_string(), self.check_consumer(now));
        checks.insert("dead_letter".to_string(), Self::check_dead_letter(now));

        // An idle consumer is not a failure
        let healthy = checks
            .values()
            .all(|check| check.status == "healthy" || check.status == "idle");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service: self.service_name.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_broker(&self, now: u64) -> HealthCheck {
        if self.broker_connected.load(Ordering::Relaxed) {
            HealthCheck::new("healthy", "Broker connection established", now)
        } else {
            HealthCheck::new("unhealthy", "Broker connection lost or not established", now)
        }
    }

    fn check_consumer(&self, now: u64) -> HealthCheck {
        if !self.consumer_running.load(Ordering::Relaxed) {
            return HealthCheck::new("unhealthy", "Consumer is not running", now);
        }

        let last = self.last_delivery_committed.load(Ordering::Relaxed);
        if last == 0 {
            HealthCheck::new("healthy", "No deliveries processed yet", now)
        } else if now.saturating_sub(last) > DELIVERY_STALENESS_THRESHOLD_SECONDS {
            HealthCheck::new(
                "idle",
                format!("No delivery activity for {} seconds", now - last),
                now,
            )
        } else {
            HealthCheck::new("healthy", "Recent delivery activity", now)
        }
    }

    fn check_dead_letter(now: u64) -> HealthCheck {
        let failures = metrics().get_metrics().dead_letters.publish_failures;
        if failures == 0 {
            HealthCheck::new("healthy", "Dead-letter channel reachable", now)
        } else {
            HealthCheck::new(
                "unhealthy",
                format!("{failures} dead-letter publication(s) failed"),
                now,
            )
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn new(status: &str, message: impl Into<String>, now: u64) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_server_creation() {
        let server = HealthServer::new("orderguard", 8080);
        assert_eq!(server.service_name, "orderguard");
        assert_eq!(server.port(), 8080);
        assert!(!server.is_ready());
    }

    #[test]
    fn test_readiness_requires_broker_and_consumer() {
        let server = HealthServer::new("orderguard", 8080);

        server.set_broker_connected(true);
        assert!(!server.is_ready());

        server.set_consumer_running(true);
        assert!(server.is_ready());

        server.set_broker_connected(false);
        assert!(!server.is_ready());
    }

    #[test]
    fn test_broker_check() {
        let server = HealthServer::new("orderguard", 8080);
        let now = current_timestamp();

        assert_eq!(server.check_broker(now).status, "unhealthy");
        server.set_broker_connected(true);
        assert_eq!(server.check_broker(now).status, "healthy");
    }

    #[test]
    fn test_consumer_check_staleness() {
        let server = HealthServer::new("orderguard", 8080);
        let now = current_timestamp();

        assert_eq!(server.check_consumer(now).status, "unhealthy");

        server.set_consumer_running(true);
        assert_eq!(server.check_consumer(now).status, "healthy");

        server.mark_delivery_committed();
        assert_eq!(server.check_consumer(now).status, "healthy");

        server
            .last_delivery_committed
            .store(now - 600, Ordering::Relaxed);
        assert_eq!(server.check_consumer(now).status, "idle");
    }

    #[test]
    fn test_health_status_reports_all_checks() {
        let server = HealthServer::new("orderguard", 8080);
        server.set_broker_connected(false);

        let status = server.health_status();
        assert_eq!(status.status, "degraded");
        assert_eq!(status.service, "orderguard");
        assert!(status.checks.contains_key("broker"));
        assert!(status.checks.contains_key("consumer"));
        assert!(status.checks.contains_key("dead_letter"));
    }
}
