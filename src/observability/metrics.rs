//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! delivery outcomes, broker connectivity and consumer lifecycle.

use crate::processing::classifier::FailureKind;
use crate::protocol::DeadLetterReason;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing-time samples kept for percentile calculation
const MAX_PROCESSING_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Delivery outcomes
    deliveries_received: AtomicU64,
    deliveries_committed: AtomicU64,
    duplicates_skipped: AtomicU64,
    retries_scheduled: AtomicU64,
    deliveries_abandoned: AtomicU64,
    commit_failures: AtomicU64,

    // Failures by kind
    business_failures: AtomicU64,
    transient_failures: AtomicU64,
    unknown_failures: AtomicU64,

    // Dead-letter channel
    dead_lettered: AtomicU64,
    undecodable: AtomicU64,
    dead_letter_publish_failures: AtomicU64,

    // Broker
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    processing_times: Mutex<Vec<u64>>, // in milliseconds

    // Lifecycle
    consumer_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            deliveries_received: AtomicU64::new(0),
            deliveries_committed: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            deliveries_abandoned: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            business_failures: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            unknown_failures: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            undecodable: AtomicU64::new(0),
            dead_letter_publish_failures: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            consumer_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Delivery metrics
    pub fn delivery_received(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_committed(&self) {
        self.deliveries_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_skipped(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_abandoned(&self) {
        self.deliveries_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failed(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_recorded(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Business => &self.business_failures,
            FailureKind::Transient => &self.transient_failures,
            FailureKind::Unknown => &self.unknown_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_lettered(&self, reason: DeadLetterReason) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if reason == DeadLetterReason::Deserialization {
            self.undecodable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dead_letter_publish_failed(&self) {
        self.dead_letter_publish_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_PROCESSING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Broker metrics
    pub fn broker_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn broker_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn broker_connection_lost(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_consumer_state(&self, state: &str) {
        if let Ok(mut current_state) = self.consumer_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.deliveries_received,
            &self.deliveries_committed,
            &self.duplicates_skipped,
            &self.retries_scheduled,
            &self.deliveries_abandoned,
            &self.commit_failures,
            &self.business_failures,
            &self.transient_failures,
            &self.unknown_failures,
            &self.dead_lettered,
            &self.undecodable,
            &self.dead_letter_publish_failures,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.connection_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.consumer_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate processing time statistics: (avg, p50, p95, p99)
    fn processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.broker_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn current_consumer_state(&self) -> String {
        self.consumer_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95, p99) = self.processing_time_statistics();

        MetricsSnapshot {
            deliveries: DeliveryMetrics {
                received: self.deliveries_received.load(Ordering::Relaxed),
                committed: self.deliveries_committed.load(Ordering::Relaxed),
                duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
                retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
                abandoned: self.deliveries_abandoned.load(Ordering::Relaxed),
                commit_failures: self.commit_failures.load(Ordering::Relaxed),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
            },
            failures: FailureMetrics {
                business: self.business_failures.load(Ordering::Relaxed),
                transient: self.transient_failures.load(Ordering::Relaxed),
                unknown: self.unknown_failures.load(Ordering::Relaxed),
            },
            dead_letters: DeadLetterMetrics {
                published: self.dead_lettered.load(Ordering::Relaxed),
                undecodable: self.undecodable.load(Ordering::Relaxed),
                publish_failures: self.dead_letter_publish_failures.load(Ordering::Relaxed),
            },
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_consumer_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub deliveries: DeliveryMetrics,
    pub failures: FailureMetrics,
    pub dead_letters: DeadLetterMetrics,
    pub broker: BrokerMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub received: u64,
    pub committed: u64,
    pub duplicates_skipped: u64,
    pub retries_scheduled: u64,
    pub abandoned: u64,
    pub commit_failures: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct FailureMetrics {
    pub business: u64,
    pub transient: u64,
    pub unknown: u64,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterMetrics {
    pub published: u64,
    pub undecodable: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;

    lower + (upper - lower) * index.fract()
}
