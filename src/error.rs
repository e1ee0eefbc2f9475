//! Crate-level error types
//!
//! Each layer has its own `thiserror` enum; [`RelayError`] collects them for
//! the binaries. Failure text that leaves the process (dead-letter headers)
//! goes through [`sanitize_error_message`] first.

use crate::consumer::LifecycleError;
use crate::producer::ProducerError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of failure text published on the dead-letter channel
pub const MAX_FAILURE_MESSAGE_LEN: usize = 500;

const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Main error type for the service binaries
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Consumer error: {0}")]
    LifecycleError(#[from] LifecycleError),

    #[error("Producer error: {0}")]
    ProducerError(#[from] ProducerError),

    #[error("Broker error: {0}")]
    BrokerError(#[from] MqttError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),

    #[error("Consumer stopped: {reason}")]
    ConsumerFailed { reason: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl RelayError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// The consumer hit an unrecoverable failure
    pub fn consumer_failed<S: Into<String>>(reason: S) -> Self {
        Self::ConsumerFailed {
            reason: reason.into(),
        }
    }
}

/// Sanitize failure text before it leaves the process
///
/// Redacts `password=`, `token=`, `key=` and `secret=` values and paths into
/// credential directories, then truncates to [`MAX_FAILURE_MESSAGE_LEN`]
/// bytes on a character boundary.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_FAILURE_MESSAGE_LEN {
        let mut cut = MAX_FAILURE_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for service operations
pub type RelayResult<T> = Result<T, RelayError>;
