use std::{collections::HashMap, sync::Arc, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
    BasicProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    DeliveryConfig, Envelope, MessageId,
    broker::{BrokerClient, BrokerError, DeliveryStream},
    dead_letter::{DeadLetterReason, DeadLetterSink},
};

const ATTEMPT_HEADER: &str = "x-attempt";
const MAX_ATTEMPTS_HEADER: &str = "x-max-attempts";

/// RabbitMQ broker client.
///
/// ## Design
///
/// - Messages go through the default exchange straight to one durable queue
/// - Publisher confirms are enabled on the channel; a broker `nack` is a
///   rejection
/// - Messages are persistent and carry the envelope id as AMQP `message_id`
/// - Retry metadata travels in the `x-attempt` and `x-max-attempts` headers.
///   Messages without `x-max-attempts` get the configured `max_attempts`
/// - Each subscription sets `basic_qos` to the configured prefetch, so the
///   broker never pushes more unacked deliveries than the consumer may process
///
/// Dead-lettering records the envelope in the sink first and then rejects the
/// delivery without requeue, so a dead-letter exchange configured on the queue
/// sees it too.
///
/// ## Redelivery delay
///
/// RabbitMQ has no per-message visibility delay. A `nack` with a delay returns
/// right away and a background task republishes the envelope with the next
/// attempt once the delay elapsed, then acks the original delivery. Until
/// then the original stays unacked and counts against the prefetch window.
/// Those tasks outlive a consumer shutdown; if the connection closes first,
/// RabbitMQ redelivers the original with its previous attempt count.
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - Broker calls are async and may be made concurrently
pub struct RabbitMqBroker<S> {
    /// Shared AMQP channel.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Main queue name.
    queue: String,
    /// Unacked deliveries allowed per subscription.
    prefetch: u16,
    /// Attempt budget for messages published without one.
    default_max_attempts: u32,
    /// Deliveries consumed but not yet settled, by message id.
    leases: Arc<Mutex<HashMap<MessageId, Lease>>>,
    sink: S,
}

struct Lease {
    acker: Acker,
    envelope: Envelope,
}

impl<S: Clone> Clone for RabbitMqBroker<S> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            queue: self.queue.clone(),
            prefetch: self.prefetch,
            default_max_attempts: self.default_max_attempts,
            leases: Arc::clone(&self.leases),
            sink: self.sink.clone(),
        }
    }
}

impl<S> RabbitMqBroker<S> {
    /// Enable publisher confirms on `channel` and declare `queue` as durable.
    ///
    /// `config.prefetch` bounds the unacked deliveries per subscription and
    /// `config.max_attempts` applies to messages without an attempt budget.
    #[tracing::instrument(skip(channel, config, sink))]
    pub async fn try_new(
        channel: lapin::Channel,
        queue: &str,
        config: &DeliveryConfig,
        sink: S,
    ) -> Result<Self, BrokerError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(BrokerError::transport)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::transport)?;

        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            queue: queue.to_owned(),
            prefetch: qos_prefetch(config.prefetch),
            default_max_attempts: config.max_attempts,
            leases: Arc::new(Mutex::new(HashMap::new())),
            sink,
        })
    }

    async fn take_lease(&self, id: &MessageId) -> Result<Lease, BrokerError> {
        self.leases
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| BrokerError::unknown_delivery(*id))
    }
}

#[async_trait]
impl<S> BrokerClient for RabbitMqBroker<S>
where
    S: DeadLetterSink + 'static,
{
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        send(&self.channel, &self.queue, &envelope).await
    }

    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError> {
        let consumer = {
            let channel = self.channel.lock().await;
            channel
                .basic_qos(self.prefetch, BasicQosOptions::default())
                .await
                .map_err(BrokerError::transport)?;
            channel
                .basic_consume(
                    &self.queue,
                    "",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::transport)?
        };
        let subscription = Subscription {
            channel: Arc::clone(&self.channel),
            tag: consumer.tag(),
        };
        let leases = Arc::clone(&self.leases);
        let default_max_attempts = self.default_max_attempts;

        let stream = stream! {
            let _subscription = subscription;
            let mut consumer = consumer;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = consumer.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        match decode(&delivery.properties, delivery.data, default_max_attempts) {
                            Ok(envelope) => {
                                leases.lock().await.insert(envelope.id(), Lease {
                                    acker: delivery.acker,
                                    envelope: envelope.clone(),
                                });
                                yield Ok(envelope);
                            }
                            Err(err) => {
                                // Undecodable deliveries go to the broker's own
                                // dead-letter exchange, if any.
                                if let Err(reject_err) = delivery
                                    .acker
                                    .reject(BasicRejectOptions { requeue: false })
                                    .await
                                {
                                    tracing::error!(?reject_err, "Failed to reject malformed delivery");
                                }
                                yield Err(err);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        yield Err(BrokerError::transport(err));
                        break;
                    }
                    None => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[tracing::instrument(skip(self))]
    async fn ack(&self, id: &MessageId) -> Result<(), BrokerError> {
        let lease = self.take_lease(id).await?;
        lease
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::transport)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn nack(
        &self,
        id: &MessageId,
        next_attempt: u32,
        visibility_delay: Duration,
    ) -> Result<(), BrokerError> {
        let lease = self.take_lease(id).await?;

        if visibility_delay.is_zero() {
            return redeliver(&self.channel, &self.queue, lease, next_attempt).await;
        }

        let channel = Arc::clone(&self.channel);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(visibility_delay).await;
            if let Err(err) = redeliver(&channel, &queue, lease, next_attempt).await {
                tracing::error!(%err, "Delayed redelivery failed");
            }
        });
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(id = %envelope.id(), reason = %reason))]
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), BrokerError> {
        if !self.leases.lock().await.contains_key(&envelope.id()) {
            return Err(BrokerError::unknown_delivery(envelope.id()));
        }

        self.sink
            .record(envelope, reason)
            .await
            .map_err(BrokerError::sink)?;

        let lease = self.take_lease(&envelope.id()).await?;
        lease
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(BrokerError::transport)?;
        Ok(())
    }
}

/// Cancels the consumer tag once its delivery stream is dropped, so the broker
/// stops routing messages to a subscription nobody reads.
struct Subscription {
    channel: Arc<Mutex<lapin::Channel>>,
    tag: ShortString,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = Arc::clone(&self.channel);
        let tag = self.tag.clone();
        runtime.spawn(async move {
            let result = channel
                .lock()
                .await
                .basic_cancel(tag.as_str(), BasicCancelOptions::default())
                .await;
            if let Err(err) = result {
                tracing::debug!(?err, tag = tag.as_str(), "Failed to cancel consumer");
            }
        });
    }
}

/// Publish `envelope` and wait for the broker's confirm.
async fn send(
    channel: &Mutex<lapin::Channel>,
    queue: &str,
    envelope: &Envelope,
) -> Result<(), BrokerError> {
    let properties = BasicProperties::default()
        .with_message_id(ShortString::from(envelope.id().to_string()))
        .with_delivery_mode(2)
        .with_timestamp(u64::try_from(envelope.created_at().timestamp()).unwrap_or_default())
        .with_headers(encode_headers(envelope));

    let channel = channel.lock().await;
    let confirmation = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            envelope.payload(),
            properties,
        )
        .await
        .map_err(BrokerError::transport)?
        .await
        .map_err(BrokerError::transport)?;

    if confirmation.is_nack() {
        return Err(BrokerError::rejected("broker refused the message"));
    }
    Ok(())
}

/// Republish the leased envelope with `next_attempt` and settle the original.
async fn redeliver(
    channel: &Mutex<lapin::Channel>,
    queue: &str,
    lease: Lease,
    next_attempt: u32,
) -> Result<(), BrokerError> {
    if let Err(err) = send(channel, queue, &lease.envelope.with_attempt(next_attempt)).await {
        // Let the broker redeliver the original instead.
        lease
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(BrokerError::transport)?;
        return Err(err);
    }

    lease
        .acker
        .ack(BasicAckOptions::default())
        .await
        .map_err(BrokerError::transport)?;
    Ok(())
}

/// `basic_qos` window for a consumer prefetch: at least one, at most what
/// AMQP can express.
fn qos_prefetch(prefetch: usize) -> u16 {
    u16::try_from(prefetch.max(1)).unwrap_or(u16::MAX)
}

fn encode_headers(envelope: &Envelope) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(ATTEMPT_HEADER),
        AMQPValue::LongUInt(envelope.attempt()),
    );
    headers.insert(
        ShortString::from(MAX_ATTEMPTS_HEADER),
        AMQPValue::LongUInt(envelope.max_attempts()),
    );
    headers
}

/// Rebuild an envelope from AMQP properties and body.
///
/// A missing or unreadable attempt header counts as the first attempt, a
/// missing or unreadable budget as `default_max_attempts`.
fn decode(
    properties: &BasicProperties,
    payload: Vec<u8>,
    default_max_attempts: u32,
) -> Result<Envelope, BrokerError> {
    let id: MessageId = properties
        .message_id()
        .as_ref()
        .ok_or_else(|| BrokerError::rejected("delivery has no message id"))?
        .as_str()
        .parse()
        .map_err(BrokerError::rejected)?;

    let created_at = (*properties.timestamp())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0))
        .unwrap_or_else(Utc::now);

    let headers = properties.headers().as_ref();
    let attempt = header_u32(headers, ATTEMPT_HEADER).unwrap_or(0);
    let max_attempts = header_u32(headers, MAX_ATTEMPTS_HEADER).unwrap_or(default_max_attempts);

    Ok(Envelope::from_parts(
        id,
        payload,
        created_at,
        attempt,
        max_attempts,
    ))
}

fn header_u32(headers: Option<&FieldTable>, name: &str) -> Option<u32> {
    match headers?.inner().get(&ShortString::from(name))? {
        AMQPValue::LongUInt(value) => Some(*value),
        AMQPValue::LongInt(value) => u32::try_from(*value).ok(),
        AMQPValue::LongLongInt(value) => u32::try_from(*value).ok(),
        AMQPValue::ShortUInt(value) => Some(u32::from(*value)),
        AMQPValue::ShortShortUInt(value) => Some(u32::from(*value)),
        _ => None,
    }
}
