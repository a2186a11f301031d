//! Dead-letter sink abstractions and backends.
//!
//! A dead-letter sink is the terminal store for envelopes that cannot be
//! processed within policy limits. It is append-only: once a record is written
//! this crate never changes or removes it.
//!
//! ## Idempotency
//!
//! Recording the same message id twice stores a single record and the second
//! call succeeds. This is what allows the consumer to retry the dead-letter
//! step after a partial failure without duplicating records.
//!
//! Concrete implementations are provided by [`inmemory`] and [`sqlx`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{Envelope, outcome::FailureReason};

pub use inmemory::InMemoryDeadLetterSink;

/// Why an envelope was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retryable failures used up the attempt budget.
    MaxAttemptsExceeded,
    /// The handler reported a permanent failure.
    FatalFailure(FailureReason),
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAttemptsExceeded => f.write_str("max attempts exceeded"),
            Self::FatalFailure(reason) => write!(f, "fatal failure: {reason}"),
        }
    }
}

/// Envelope stored in a dead-letter sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    envelope: Envelope,
    reason: DeadLetterReason,
    quarantined_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub(crate) fn new(
        envelope: Envelope,
        reason: DeadLetterReason,
        quarantined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope,
            reason,
            quarantined_at,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn reason(&self) -> &DeadLetterReason {
        &self.reason
    }

    pub fn quarantined_at(&self) -> DateTime<Utc> {
        self.quarantined_at
    }
}

/// Append-only terminal store for dead-lettered envelopes.
///
/// Implementations must be safe to call concurrently and idempotent on the
/// envelope id.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a record for `envelope`, or do nothing if its id is already
    /// recorded.
    async fn record(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), SinkError>;
}

#[async_trait::async_trait]
impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    async fn record(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), SinkError> {
        (**self).record(envelope, reason).await
    }
}

/// Error returned by dead-letter sinks.
#[derive(Debug)]
pub struct SinkError {
    context: SpanTrace,
    kind: SinkErrorKind,
}

/// Dead-letter sink error kinds.
#[derive(Debug)]
pub enum SinkErrorKind {
    /// The backing storage could not accept the write. Retrying later may
    /// succeed.
    StorageUnavailable(tower::BoxError),
}

impl SinkError {
    /// Create a storage-unavailable error.
    pub fn storage_unavailable(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SinkErrorKind::StorageUnavailable(err.into()),
        }
    }

    pub fn kind(&self) -> &SinkErrorKind {
        &self.kind
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SinkErrorKind::StorageUnavailable(err) => writeln!(f, "Storage unavailable: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SinkErrorKind::StorageUnavailable(err) => Some(err.as_ref()),
        }
    }
}
