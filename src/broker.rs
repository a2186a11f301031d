//! Broker client abstraction and backends.
//!
//! The delivery core never talks to a transport directly. Everything it needs
//! from a broker is captured by [`BrokerClient`]:
//!
//! - publish with a durable-receipt confirmation
//! - a lazy, restartable stream of deliveries
//! - acknowledgement, negative acknowledgement with redelivery, and
//!   dead-lettering
//!
//! ## Leases
//!
//! A delivered envelope is *leased* to the consumer until it is acked, nacked
//! or dead-lettered. A backend must not hand out a second delivery of an id
//! while it is leased. This is what keeps redeliveries of the same message in
//! order.
//!
//! Concrete implementations are provided by [`inmemory`] and [`rabbitmq`]
//! (feature-gated).

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{sync::Arc, time::Duration};

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope, MessageId,
    dead_letter::{DeadLetterReason, SinkError},
};

pub use inmemory::{InMemoryBroker, Location};

/// Stream of leased envelopes returned by [`BrokerClient::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Envelope, BrokerError>>;

/// Capability interface over a message broker.
///
/// All methods must be safe to call concurrently from many workers.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Store `envelope` in the main queue.
    ///
    /// Resolves once the broker confirmed durable receipt. A rejected publish
    /// must leave nothing in the queue.
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Subscribe to the main queue.
    ///
    /// The stream ends when `cancel` is triggered or the connection is lost.
    /// Callers may subscribe again after it ended. An `Err` item reports one
    /// delivery that could not be handed out; the subscription carries on.
    async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError>;

    /// Remove a leased envelope after successful processing.
    async fn ack(&self, id: &MessageId) -> Result<(), BrokerError>;

    /// Return a leased envelope to the main queue.
    ///
    /// The redelivery carries `next_attempt` and stays invisible to consumers
    /// for `visibility_delay`.
    async fn nack(
        &self,
        id: &MessageId,
        next_attempt: u32,
        visibility_delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Move a leased envelope to the dead-letter sink.
    ///
    /// Removing it from the main queue and recording it in the sink is one
    /// failure-atomic step: if the sink write fails the envelope stays leased
    /// and the call may be retried.
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), BrokerError>;
}

#[async_trait::async_trait]
impl<B> BrokerClient for Arc<B>
where
    B: BrokerClient + ?Sized,
{
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        (**self).publish(envelope).await
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError> {
        (**self).consume(cancel).await
    }

    async fn ack(&self, id: &MessageId) -> Result<(), BrokerError> {
        (**self).ack(id).await
    }

    async fn nack(
        &self,
        id: &MessageId,
        next_attempt: u32,
        visibility_delay: Duration,
    ) -> Result<(), BrokerError> {
        (**self).nack(id, next_attempt, visibility_delay).await
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), BrokerError> {
        (**self).dead_letter(envelope, reason).await
    }
}

/// Error returned by broker operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct BrokerError {
    context: SpanTrace,
    kind: BrokerErrorKind,
}

/// Broker error kinds.
#[derive(Debug)]
pub enum BrokerErrorKind {
    /// The broker refused to take responsibility for a message.
    Rejected(tower::BoxError),
    /// Connection or protocol failure.
    Transport(tower::BoxError),
    /// The id is not currently leased by this client.
    UnknownDelivery(MessageId),
    /// The dead-letter sink could not record the envelope.
    Sink(SinkError),
}

impl BrokerError {
    pub fn rejected(err: impl Into<tower::BoxError>) -> Self {
        Self::new(BrokerErrorKind::Rejected(err.into()))
    }

    pub fn transport(err: impl Into<tower::BoxError>) -> Self {
        Self::new(BrokerErrorKind::Transport(err.into()))
    }

    pub fn unknown_delivery(id: MessageId) -> Self {
        Self::new(BrokerErrorKind::UnknownDelivery(id))
    }

    pub fn sink(err: SinkError) -> Self {
        Self::new(BrokerErrorKind::Sink(err))
    }

    fn new(kind: BrokerErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &BrokerErrorKind {
        &self.kind
    }

    /// Whether the failure came from the dead-letter sink.
    pub fn is_sink_unavailable(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Sink(_))
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BrokerErrorKind::Rejected(err) => writeln!(f, "Rejected by broker: {err}"),
            BrokerErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            BrokerErrorKind::UnknownDelivery(id) => writeln!(f, "Unknown delivery: {id}"),
            BrokerErrorKind::Sink(err) => writeln!(f, "Dead-letter sink error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            BrokerErrorKind::Rejected(err) | BrokerErrorKind::Transport(err) => Some(err.as_ref()),
            BrokerErrorKind::UnknownDelivery(_) => None,
            BrokerErrorKind::Sink(err) => Some(err),
        }
    }
}
