//! Handler results.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of one handler invocation.
///
/// Handlers never signal failure by panicking or returning errors: every
/// invocation ends in exactly one of these variants. A panic is still caught
/// by the consumer and mapped to [`FailureReason::HandlerCrashed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was processed and can be acknowledged.
    Success,
    /// Transient failure. The message is redelivered while attempts remain.
    RetryableFailure(FailureReason),
    /// Permanent failure (e.g. malformed payload). The message is
    /// dead-lettered immediately.
    FatalFailure(FailureReason),
}

impl DeliveryOutcome {
    /// Retryable failure with a free-text reason.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(FailureReason::Other(reason.into()))
    }

    /// Fatal failure with a free-text reason.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure(FailureReason::Other(reason.into()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(reason) | Self::FatalFailure(reason) => Some(reason),
        }
    }
}

/// Why a handler invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The handler did not finish within the handler timeout.
    Timeout,
    /// The handler panicked.
    HandlerCrashed,
    /// Application-defined reason.
    Other(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("handler timed out"),
            Self::HandlerCrashed => f.write_str("handler crashed"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}
