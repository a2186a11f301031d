use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_stream::stream;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope, MessageId,
    broker::{BrokerClient, BrokerError, DeliveryStream},
    dead_letter::{DeadLetterReason, DeadLetterSink},
};

/// In-memory broker for testing or local pipelines.
///
/// Keeps the main queue, the leased (in-flight) envelopes and the terminal
/// states in a shared structure, and dead-letters into the sink `S`. It
/// honours visibility delays and never leases the same id twice.
///
/// Ids of acked and dead-lettered messages are kept for the broker's whole
/// lifetime, so [`location`](InMemoryBroker::location) can still answer for
/// them and a settled id cannot be published again. Memory grows with every
/// settled message, which suits tests and short-lived pipelines only.
///
/// Clones share the same queues.
pub struct InMemoryBroker<S> {
    state: Arc<Mutex<State>>,
    wakeup: Arc<Notify>,
    sink: S,
}

/// Where a message currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Waiting in the main queue, possibly still invisible.
    Pending,
    /// Leased to a consumer.
    InFlight,
    /// Recorded in the dead-letter sink.
    DeadLettered,
    /// Acknowledged and gone.
    Acked,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Pending>,
    in_flight: HashMap<MessageId, Envelope>,
    acked: HashSet<MessageId>,
    dead_lettered: HashSet<MessageId>,
}

struct Pending {
    envelope: Envelope,
    visible_at: Instant,
}

enum Lease {
    Ready(Envelope),
    NotBefore(Instant),
    Empty,
}

impl State {
    fn location(&self, id: &MessageId) -> Option<Location> {
        if self.in_flight.contains_key(id) {
            Some(Location::InFlight)
        } else if self.dead_lettered.contains(id) {
            Some(Location::DeadLettered)
        } else if self.acked.contains(id) {
            Some(Location::Acked)
        } else if self.pending.iter().any(|p| p.envelope.id() == *id) {
            Some(Location::Pending)
        } else {
            None
        }
    }

    fn take_visible(&mut self, now: Instant) -> Lease {
        let ready = self
            .pending
            .iter()
            .position(|p| p.visible_at <= now && !self.in_flight.contains_key(&p.envelope.id()));

        if let Some(envelope) = ready.and_then(|idx| self.pending.remove(idx)).map(|p| p.envelope) {
            self.in_flight.insert(envelope.id(), envelope.clone());
            return Lease::Ready(envelope);
        }

        match self.pending.iter().map(|p| p.visible_at).min() {
            Some(at) => Lease::NotBefore(at),
            None => Lease::Empty,
        }
    }
}

impl<S> InMemoryBroker<S> {
    /// Create an empty broker dead-lettering into `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            wakeup: Arc::new(Notify::new()),
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Where the message `id` currently is, or `None` if it was never
    /// published.
    pub async fn location(&self, id: &MessageId) -> Option<Location> {
        self.state.lock().await.location(id)
    }

    /// Envelopes waiting in the main queue, including invisible ones.
    pub async fn pending(&self) -> Vec<Envelope> {
        let state = self.state.lock().await;
        state.pending.iter().map(|p| p.envelope.clone()).collect()
    }

    /// Envelopes currently leased to consumers.
    pub async fn in_flight(&self) -> Vec<Envelope> {
        self.state.lock().await.in_flight.values().cloned().collect()
    }

    pub async fn acked_count(&self) -> usize {
        self.state.lock().await.acked.len()
    }
}

impl<S: Clone> Clone for InMemoryBroker<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            wakeup: Arc::clone(&self.wakeup),
            sink: self.sink.clone(),
        }
    }
}

#[async_trait::async_trait]
impl<S> BrokerClient for InMemoryBroker<S>
where
    S: DeadLetterSink + 'static,
{
    #[tracing::instrument(skip_all, fields(id = %envelope.id()))]
    async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.location(&envelope.id()).is_some() {
            return Err(BrokerError::rejected(format!(
                "message {} was already published",
                envelope.id()
            )));
        }

        state.pending.push_back(Pending {
            envelope,
            visible_at: Instant::now(),
        });
        drop(state);

        self.wakeup.notify_waiters();
        tracing::debug!("Message stored in in-memory queue");
        Ok(())
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError> {
        let state = Arc::clone(&self.state);
        let wakeup = Arc::clone(&self.wakeup);

        let stream = stream! {
            loop {
                // Registered before looking at the queue so a publish racing
                // with the check still wakes us up.
                let notified = wakeup.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let lease = state.lock().await.take_visible(Instant::now());
                let deadline = match lease {
                    Lease::Ready(envelope) => {
                        yield Ok(envelope);
                        continue;
                    }
                    Lease::NotBefore(at) => Some(at),
                    Lease::Empty => None,
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut notified => {}
                    _ = sleep_until(deadline) => {}
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[tracing::instrument(skip(self))]
    async fn ack(&self, id: &MessageId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(id)
            .ok_or_else(|| BrokerError::unknown_delivery(*id))?;
        state.acked.insert(*id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn nack(
        &self,
        id: &MessageId,
        next_attempt: u32,
        visibility_delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let envelope = state
            .in_flight
            .remove(id)
            .ok_or_else(|| BrokerError::unknown_delivery(*id))?;

        state.pending.push_back(Pending {
            envelope: envelope.with_attempt(next_attempt),
            visible_at: Instant::now() + visibility_delay,
        });
        drop(state);

        self.wakeup.notify_waiters();
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(id = %envelope.id(), reason = %reason))]
    async fn dead_letter(
        &self,
        envelope: &Envelope,
        reason: &DeadLetterReason,
    ) -> Result<(), BrokerError> {
        // The lock is held across the sink write so that no other operation
        // observes the envelope half moved.
        let mut state = self.state.lock().await;
        if state.dead_lettered.contains(&envelope.id()) {
            return Ok(());
        }
        if !state.in_flight.contains_key(&envelope.id()) {
            return Err(BrokerError::unknown_delivery(envelope.id()));
        }

        self.sink
            .record(envelope, reason)
            .await
            .map_err(BrokerError::sink)?;

        state.in_flight.remove(&envelope.id());
        state.dead_lettered.insert(envelope.id());
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
