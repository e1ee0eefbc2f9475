//! Failure classification
//!
//! Maps a handler error onto the closed set of failure kinds the retry
//! policy understands. Classification looks only at the error variant.

use crate::processing::handler::HandlerError;
use crate::protocol::DeadLetterReason;
use serde::Serialize;
use std::fmt;

/// Kind of a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Semantically invalid operation; never retried
    Business,
    /// Infrastructure or timeout failure; retried within budget
    Transient,
    /// Unrecognized failure; retried within the same budget as transient
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Business => "business",
            FailureKind::Transient => "transient",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Whether the retry policy may schedule another attempt for this kind
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Business)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureKind> for DeadLetterReason {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Business => DeadLetterReason::Business,
            FailureKind::Transient => DeadLetterReason::Transient,
            FailureKind::Unknown => DeadLetterReason::Unknown,
        }
    }
}

/// Classify a handler error
pub fn classify(error: &HandlerError) -> FailureKind {
    match error {
        HandlerError::Business { .. } => FailureKind::Business,
        HandlerError::Transient { .. } | HandlerError::Timeout { .. } => FailureKind::Transient,
        HandlerError::Unexpected(_) => FailureKind::Unknown,
    }
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    Failed { kind: FailureKind, message: String },
}

impl ProcessingOutcome {
    pub fn from_result(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => ProcessingOutcome::Success,
            Err(error) => ProcessingOutcome::Failed {
                kind: classify(&error),
                message: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }
}
