//! Reconnection decisions and connection state transitions
//!
//! Everything here is side-effect free apart from logging, so the
//! supervisor loop in `client.rs` stays small.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Extra time granted on top of the summed backoff when waiting for a ConnAck
const CONNECTION_TIMEOUT_BUFFER_MS: u64 = 30_000;

/// Reconnection decisions for the broker connection supervisor
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnection attempt should be made
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => {
                Duration::from_millis(max_total_time + CONNECTION_TIMEOUT_BUFFER_MS)
            }
            None => Duration::from_secs(60),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt = attempt, "Broker reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Starting broker reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "Broker connection permanently failed");
            }
            _ => {
                info!("Broker connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        if config.backoff_pattern.iter().any(|&delay| delay == 0) {
            return Err("backoff_pattern entries must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}
