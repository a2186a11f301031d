//! Observability hooks.
//!
//! Both the [`Publisher`](crate::Publisher) and the
//! [`ConsumerLoop`](crate::ConsumerLoop) report every state transition of a
//! message to a [`DeliveryHook`]. The default implementation logs with
//! `tracing`; replace it to feed metrics or audit logs.

use std::{sync::Arc, time::Duration};

use crate::{
    Envelope, MessageId, dead_letter::DeadLetterReason, outcome::FailureReason,
    publisher::PublishError,
};

/// Hook trait for observing delivery lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait DeliveryHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    /// The broker confirmed durable receipt of a new message.
    fn on_published(&self, id: &MessageId);
    fn on_publish_error(&self, id: &MessageId, error: &PublishError);
    /// An envelope was leased and is about to be processed.
    fn on_delivered(&self, envelope: &Envelope);
    fn on_acked(&self, envelope: &Envelope);
    /// The envelope went back to the main queue for another attempt.
    fn on_requeued(&self, envelope: &Envelope, reason: &FailureReason, delay: Duration);
    fn on_dead_lettered(&self, envelope: &Envelope, reason: &DeadLetterReason);
    /// The envelope was handed back unprocessed during shutdown.
    fn on_released(&self, envelope: &Envelope);
    /// Writing to the dead-letter sink failed and will be retried.
    fn on_sink_unavailable(
        &self,
        envelope: &Envelope,
        error: &dyn std::error::Error,
        retry_in: Duration,
    );
    fn on_broker_error(&self, error: &dyn std::error::Error);
}

impl<T> DeliveryHook for Arc<T>
where
    T: DeliveryHook + ?Sized,
{
    fn on_startup(&self) {
        (**self).on_startup()
    }

    fn on_shutdown(&self) {
        (**self).on_shutdown()
    }

    fn on_published(&self, id: &MessageId) {
        (**self).on_published(id)
    }

    fn on_publish_error(&self, id: &MessageId, error: &PublishError) {
        (**self).on_publish_error(id, error)
    }

    fn on_delivered(&self, envelope: &Envelope) {
        (**self).on_delivered(envelope)
    }

    fn on_acked(&self, envelope: &Envelope) {
        (**self).on_acked(envelope)
    }

    fn on_requeued(&self, envelope: &Envelope, reason: &FailureReason, delay: Duration) {
        (**self).on_requeued(envelope, reason, delay)
    }

    fn on_dead_lettered(&self, envelope: &Envelope, reason: &DeadLetterReason) {
        (**self).on_dead_lettered(envelope, reason)
    }

    fn on_released(&self, envelope: &Envelope) {
        (**self).on_released(envelope)
    }

    fn on_sink_unavailable(
        &self,
        envelope: &Envelope,
        error: &dyn std::error::Error,
        retry_in: Duration,
    ) {
        (**self).on_sink_unavailable(envelope, error, retry_in)
    }

    fn on_broker_error(&self, error: &dyn std::error::Error) {
        (**self).on_broker_error(error)
    }
}

/// Default hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDeliveryHook;

impl DeliveryHook for DefaultDeliveryHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_published(&self, id: &MessageId) {
        tracing::debug!(%id, attempt = 0, "Message published");
    }

    fn on_publish_error(&self, id: &MessageId, error: &PublishError) {
        tracing::error!(%id, ?error, "Error publishing message");
    }

    fn on_delivered(&self, envelope: &Envelope) {
        tracing::debug!(id = %envelope.id(), attempt = envelope.attempt(), "Message delivered");
    }

    fn on_acked(&self, envelope: &Envelope) {
        tracing::info!(id = %envelope.id(), attempt = envelope.attempt(), "Message acknowledged");
    }

    fn on_requeued(&self, envelope: &Envelope, reason: &FailureReason, delay: Duration) {
        tracing::warn!(
            id = %envelope.id(),
            attempt = envelope.attempt(),
            %reason,
            ?delay,
            "Message requeued",
        );
    }

    fn on_dead_lettered(&self, envelope: &Envelope, reason: &DeadLetterReason) {
        tracing::error!(
            id = %envelope.id(),
            attempt = envelope.attempt(),
            %reason,
            "Message dead-lettered",
        );
    }

    fn on_released(&self, envelope: &Envelope) {
        tracing::info!(id = %envelope.id(), attempt = envelope.attempt(), "Message released");
    }

    fn on_sink_unavailable(
        &self,
        envelope: &Envelope,
        error: &dyn std::error::Error,
        retry_in: Duration,
    ) {
        tracing::error!(
            id = %envelope.id(),
            ?error,
            ?retry_in,
            "Dead-letter sink unavailable",
        );
    }

    fn on_broker_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Broker error");
    }
}
