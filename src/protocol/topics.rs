//! Channel naming, consumer-group subscriptions and partition assignment
//!
//! Channels map one-to-one onto MQTT topic names. Consumer groups map onto
//! MQTT v5 shared subscriptions, so several service instances in the same
//! group split the deliveries of a channel between them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Default channel carrying inbound order events
pub const DEFAULT_MAIN_CHANNEL: &str = "orders";

/// Default channel receiving abandoned order events
pub const DEFAULT_DEAD_LETTER_CHANNEL: &str = "orders.DLT";

/// Validate a channel name for use as an MQTT topic
///
/// Channel names are concrete topics: they may not be empty, may not carry
/// wildcards and may not start with `$` (reserved for broker-internal topics).
pub fn validate_channel_name(channel: &str) -> Result<(), ValidationError> {
    if channel.trim().is_empty() {
        return Err(ValidationError::EmptyChannel);
    }

    if channel.starts_with('$') {
        return Err(ValidationError::ReservedChannel(channel.to_string()));
    }

    for ch in channel.chars() {
        if ch == '+' || ch == '#' {
            return Err(ValidationError::WildcardInChannel(ch));
        }
        if ch.is_control() {
            return Err(ValidationError::InvalidChannelChar(ch));
        }
    }

    Ok(())
}

/// Validate a consumer group name (`[a-zA-Z0-9._-]+`)
pub fn validate_group_name(group: &str) -> Result<(), ValidationError> {
    if group.is_empty() {
        return Err(ValidationError::EmptyGroup);
    }

    for ch in group.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidGroupChar(ch));
        }
    }

    Ok(())
}

/// Build the shared-subscription filter for a consumer group: `$share/{group}/{channel}`
pub fn shared_subscription(group: &str, channel: &str) -> String {
    format!("$share/{group}/{channel}")
}

/// Assign a record key to one of `partitions` partitions
///
/// The assignment is stable for the lifetime of the process, so every record
/// carrying the same key lands on the same partition worker and keeps its
/// relative order. A partition count of zero is treated as one.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions)) as u32
}

/// Channel and group validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Channel name cannot be empty")]
    EmptyChannel,
    #[error("Channel name '{0}' is reserved (starts with '$')")]
    ReservedChannel(String),
    #[error("Channel name contains wildcard: '{0}'")]
    WildcardInChannel(char),
    #[error("Channel name contains invalid character: {0:?}")]
    InvalidChannelChar(char),
    #[error("Consumer group cannot be empty")]
    EmptyGroup,
    #[error("Consumer group contains invalid character: '{0}'")]
    InvalidGroupChar(char),
}
