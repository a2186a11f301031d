//! Wire-level message unit.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Globally unique message identifier.
///
/// Assigned once when an [`Envelope`] is created and carried unchanged through
/// every redelivery. Handlers can use it as an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message container travelling between publisher, broker and consumer.
///
/// An `Envelope` bundles an opaque payload with its identity and retry
/// metadata. It is immutable: a redelivery produces a new envelope with the
/// same id and a higher attempt count, see [`Envelope::redelivery`].
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
///
/// let envelope = Envelope::new(b"user.created".to_vec(), 3);
///
/// assert_eq!(envelope.attempt(), 0);
/// assert_eq!(envelope.max_attempts(), 3);
///
/// let retry = envelope.redelivery();
/// assert_eq!(retry.id(), envelope.id());
/// assert_eq!(retry.attempt(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    attempt: u32,
    max_attempts: u32,
}

impl Envelope {
    /// Create a fresh envelope with a new id and `attempt = 0`.
    pub fn new(payload: impl Into<Vec<u8>>, max_attempts: u32) -> Self {
        Self {
            id: MessageId::generate(),
            payload: payload.into(),
            created_at: Utc::now(),
            attempt: 0,
            max_attempts,
        }
    }

    /// Rebuild an envelope received from a transport.
    pub fn from_parts(
        id: MessageId,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            id,
            payload,
            created_at,
            attempt,
            max_attempts,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Creation time. Informational only, never used for ordering.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of previous deliveries that ended in a retryable failure.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether the envelope is already past its attempt budget.
    ///
    /// Such an envelope must never be handed to a handler again.
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }

    /// Copy of this envelope for the next delivery attempt.
    pub fn redelivery(&self) -> Self {
        self.with_attempt(self.attempt.saturating_add(1))
    }

    /// Copy of this envelope carrying `attempt`.
    ///
    /// The attempt count never goes backwards: a lower value keeps the
    /// current one.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt: attempt.max(self.attempt),
            ..self.clone()
        }
    }

    /// Decode a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
