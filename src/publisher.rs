//! Confirmed publishing.
//!
//! The [`Publisher`] creates envelopes and sends them through a Tower service
//! stack ending in a [`BrokerService`]. A publish only succeeds once the broker
//! confirmed durable receipt, and a bounded timeout guards against brokers
//! that never answer.
//!
//! Publishing is never retried here. After a timeout the message may or may
//! not have been stored, and publishing again could create a duplicate. That
//! trade-off belongs to the caller.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Layer, Service, ServiceBuilder, ServiceExt as _, timeout::Timeout};
use tracing_error::SpanTrace;

use crate::{
    DeliveryConfig, Envelope, MessageId,
    broker::BrokerClient,
    hook::{DefaultDeliveryHook, DeliveryHook},
};

/// Tower service adapter for a [`BrokerClient`].
///
/// Each call publishes one envelope and resolves when the broker confirmed it.
#[derive(Clone)]
pub struct BrokerService<B> {
    broker: B,
}

impl<B> BrokerService<B> {
    pub fn new(broker: B) -> Self {
        Self { broker }
    }
}

impl<B> Service<Envelope> for BrokerService<B>
where
    B: BrokerClient + Clone,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope) -> Self::Future {
        let broker = self.broker.clone();
        Box::pin(async move {
            broker.publish(req).await?;
            Ok(())
        })
    }
}

/// Producer-side entry point.
///
/// Generic parameters:
/// - `S`: Tower service stack the envelopes go through
/// - `HK`: Hook implementation for lifecycle events
pub struct Publisher<S, HK = DefaultDeliveryHook> {
    service: S,
    max_attempts: u32,
    hook: HK,
}

impl<B> Publisher<Timeout<BrokerService<B>>>
where
    B: BrokerClient + Clone,
{
    /// Create a publisher with the default hook.
    ///
    /// Uses `config.publish_confirm_timeout` as the confirm timeout and
    /// `config.max_attempts` as the default attempt budget.
    pub fn new(broker: B, config: &DeliveryConfig) -> Self {
        let service = ServiceBuilder::new()
            .timeout(config.publish_confirm_timeout)
            .service(BrokerService::new(broker));

        Self {
            service,
            max_attempts: config.max_attempts,
            hook: DefaultDeliveryHook,
        }
    }
}

impl<S, HK> Publisher<S, HK> {
    /// Apply a Tower layer on top of the publish stack.
    pub fn layer<L>(self, layer: L) -> Publisher<L::Service, HK>
    where
        L: Layer<S>,
    {
        Publisher {
            service: layer.layer(self.service),
            max_attempts: self.max_attempts,
            hook: self.hook,
        }
    }

    /// Replace the hook while keeping the service stack.
    pub fn with_hook<HK2: DeliveryHook>(self, hook: HK2) -> Publisher<S, HK2> {
        Publisher {
            service: self.service,
            max_attempts: self.max_attempts,
            hook,
        }
    }
}

impl<S, HK> Publisher<S, HK>
where
    S: Service<Envelope, Response = ()> + Clone + Send,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
    HK: DeliveryHook,
{
    /// Publish `payload` and wait for the broker's confirmation.
    ///
    /// `max_attempts` overrides the configured default for this message.
    /// Returns the id assigned to the message.
    #[tracing::instrument(skip_all, fields(id))]
    pub async fn publish(
        &self,
        payload: impl Into<Vec<u8>>,
        max_attempts: Option<u32>,
    ) -> Result<MessageId, PublishError> {
        let envelope = Envelope::new(payload, max_attempts.unwrap_or(self.max_attempts));
        let id = envelope.id();
        tracing::Span::current().record("id", tracing::field::display(id));

        match self.service.clone().oneshot(envelope).await {
            Ok(()) => {
                self.hook.on_published(&id);
                Ok(id)
            }
            Err(err) => {
                let err = PublishError::from_service(err.into());
                self.hook.on_publish_error(&id, &err);
                Err(err)
            }
        }
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T>(
        &self,
        value: &T,
        max_attempts: Option<u32>,
    ) -> Result<MessageId, PublishError>
    where
        T: serde::Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(value).map_err(PublishError::serde)?;
        self.publish(payload, max_attempts).await
    }
}

/// Error returned when a publish did not get confirmed.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish error kinds.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// No confirmation arrived within the confirm timeout. The message may or
    /// may not have been stored.
    Timeout,
    /// The broker or the transport refused the message.
    TransportRejected(tower::BoxError),
    /// The value could not be serialized. Nothing was sent.
    Serde(serde_json::Error),
}

impl PublishError {
    fn from_service(err: tower::BoxError) -> Self {
        let kind = if err.is::<tower::timeout::error::Elapsed>() {
            PublishErrorKind::Timeout
        } else {
            PublishErrorKind::TransportRejected(err)
        };
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn serde(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Serde(err),
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Timeout)
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Timeout => writeln!(f, "Publish confirmation timed out"),
            PublishErrorKind::TransportRejected(err) => writeln!(f, "Publish rejected: {err}"),
            PublishErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Timeout => None,
            PublishErrorKind::TransportRejected(err) => Some(err.as_ref()),
            PublishErrorKind::Serde(err) => Some(err),
        }
    }
}
