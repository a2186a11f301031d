//! Consumer loop driving handlers, retries and dead-lettering.
//!
//! The [`ConsumerLoop`]:
//!
//! - Streams leased envelopes from a [`BrokerClient`]
//! - Runs the user [`Handler`] once per delivery, bounded by a timeout
//! - Acks, requeues or dead-letters according to the [`RetryPolicy`]
//! - Keeps at most `prefetch` envelopes in processing at any time
//!
//! Each envelope goes through `Received -> Processing -> {Acked | Requeued |
//! DeadLettered}`. Handler failures, timeouts and panics never escape the loop.
//!
//! The loop runs until its [`CancellationToken`] is triggered. It then stops
//! pulling, lets in-flight handlers finish within the shutdown grace period
//! and hands every envelope that did not finish back to the broker.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    DeliveryConfig, Envelope,
    broker::BrokerClient,
    dead_letter::DeadLetterReason,
    hook::{DefaultDeliveryHook, DeliveryHook},
    outcome::{DeliveryOutcome, FailureReason},
    retry::{RetryDecision, RetryPolicy},
};

/// Application message handler.
///
/// The consumer guarantees at-least-once delivery, so a handler may see the
/// same message more than once. [`Envelope::id`] is stable across
/// redeliveries and can serve as an idempotency key.
///
/// Implemented for every `Fn(Envelope) -> impl Future<Output = DeliveryOutcome>`.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> DeliveryOutcome;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryOutcome> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> DeliveryOutcome {
        (self)(envelope).await
    }
}

/// Message consumer.
///
/// Generic parameters:
/// - `B`: Broker client
/// - `H`: Message handler
/// - `HK`: Hook implementation for lifecycle events
pub struct ConsumerLoop<B, H, HK = DefaultDeliveryHook> {
    broker: B,
    handler: H,
    hook: HK,
    policy: RetryPolicy,
    prefetch: usize,
    handler_timeout: Duration,
    shutdown_grace: Duration,
    resubscribe_delay: Duration,
}

impl<B, H> ConsumerLoop<B, H>
where
    B: BrokerClient,
    H: Handler,
{
    /// Create a consumer with the default hook and a retry policy built from
    /// `config`.
    pub fn new(broker: B, handler: H, config: &DeliveryConfig) -> Self {
        Self {
            broker,
            handler,
            hook: DefaultDeliveryHook,
            policy: RetryPolicy::from_config(config),
            prefetch: config.prefetch.max(1),
            handler_timeout: config.handler_timeout,
            shutdown_grace: config.shutdown_grace,
            resubscribe_delay: config.resubscribe_delay,
        }
    }
}

impl<B, H, HK> ConsumerLoop<B, H, HK> {
    /// Replace the hook while keeping everything else unchanged.
    pub fn with_hook<HK2: DeliveryHook>(self, hook: HK2) -> ConsumerLoop<B, H, HK2> {
        ConsumerLoop {
            broker: self.broker,
            handler: self.handler,
            hook,
            policy: self.policy,
            prefetch: self.prefetch,
            handler_timeout: self.handler_timeout,
            shutdown_grace: self.shutdown_grace,
            resubscribe_delay: self.resubscribe_delay,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<B, H, HK> ConsumerLoop<B, H, HK>
where
    B: BrokerClient,
    H: Handler,
    HK: DeliveryHook + 'static,
{
    /// Run the consumer loop until `cancel` is triggered.
    ///
    /// Broken subscriptions are reopened after the resubscribe delay, so the
    /// loop only returns after cancellation and once every leased envelope was
    /// settled or released.
    #[tracing::instrument(skip_all, fields(prefetch = self.prefetch))]
    pub async fn run(self, cancel: CancellationToken) {
        let worker = Arc::new(Worker {
            broker: self.broker,
            handler: Arc::new(self.handler),
            hook: self.hook,
            policy: self.policy,
            handler_timeout: self.handler_timeout,
            hard_stop: CancellationToken::new(),
        });
        let slots = Arc::new(Semaphore::new(self.prefetch));
        let mut workers = JoinSet::new();

        worker.hook.on_startup();

        'subscribe: while !cancel.is_cancelled() {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'subscribe,
                subscribed = worker.broker.consume(cancel.child_token()) => subscribed,
            };

            let mut deliveries = match subscribed {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    worker.hook.on_broker_error(&err);
                    pause(self.resubscribe_delay, &cancel).await;
                    continue;
                }
            };

            loop {
                reap(&mut workers);

                // A slot is taken before pulling, so the broker keeps every
                // envelope we have no capacity for.
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'subscribe,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'subscribe,
                    },
                };

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'subscribe,
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(envelope)) => {
                        let worker = Arc::clone(&worker);
                        workers.spawn(async move {
                            worker.process(envelope).await;
                            drop(permit);
                        });
                    }
                    // Per-delivery failure. Only the end of the stream closes
                    // the subscription.
                    Some(Err(err)) => worker.hook.on_broker_error(&err),
                    None => {
                        tracing::info!("Delivery stream ended");
                        break;
                    }
                }
            }

            pause(self.resubscribe_delay, &cancel).await;
        }

        worker.hook.on_shutdown();

        if tokio::time::timeout(self.shutdown_grace, drain(&mut workers))
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = workers.len(),
                "Shutdown grace elapsed, releasing unfinished messages"
            );
            worker.hard_stop.cancel();
            drain(&mut workers).await;
        }
    }
}

/// State shared by all processing tasks of one loop.
struct Worker<B, H, HK> {
    broker: B,
    handler: Arc<H>,
    hook: HK,
    policy: RetryPolicy,
    handler_timeout: Duration,
    /// Triggered when the shutdown grace elapsed.
    hard_stop: CancellationToken,
}

impl<B, H, HK> Worker<B, H, HK>
where
    B: BrokerClient,
    H: Handler,
    HK: DeliveryHook,
{
    #[tracing::instrument(skip_all, fields(id = %envelope.id(), attempt = envelope.attempt()))]
    async fn process(&self, envelope: Envelope) {
        self.hook.on_delivered(&envelope);

        if envelope.is_exhausted() {
            self.dead_letter(&envelope, DeadLetterReason::MaxAttemptsExceeded)
                .await;
            return;
        }

        let Some(outcome) = self.invoke(&envelope).await else {
            self.release(&envelope).await;
            return;
        };

        match self.policy.decide(&envelope, &outcome) {
            RetryDecision::Ack => match self.broker.ack(&envelope.id()).await {
                Ok(()) => self.hook.on_acked(&envelope),
                Err(err) => self.hook.on_broker_error(&err),
            },
            RetryDecision::Requeue {
                next,
                delay,
                reason,
            } => match self.broker.nack(&envelope.id(), next.attempt(), delay).await {
                Ok(()) => self.hook.on_requeued(&next, &reason, delay),
                Err(err) => self.hook.on_broker_error(&err),
            },
            RetryDecision::DeadLetter(reason) => self.dead_letter(&envelope, reason).await,
        }
    }

    /// Run the handler in its own task.
    ///
    /// Returns `None` when shutdown interrupted it.
    async fn invoke(&self, envelope: &Envelope) -> Option<DeliveryOutcome> {
        let handler = Arc::clone(&self.handler);
        let input = envelope.clone();
        let mut task = tokio::spawn(async move { handler.handle(input).await });

        tokio::select! {
            joined = tokio::time::timeout(self.handler_timeout, &mut task) => Some(match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Handler crashed");
                    DeliveryOutcome::RetryableFailure(FailureReason::HandlerCrashed)
                }
                Err(_) => {
                    task.abort();
                    DeliveryOutcome::RetryableFailure(FailureReason::Timeout)
                }
            }),
            _ = self.hard_stop.cancelled() => {
                task.abort();
                None
            }
        }
    }

    /// Move the envelope to the dead-letter sink, retrying sink outages with
    /// backoff until the write is confirmed.
    async fn dead_letter(&self, envelope: &Envelope, reason: DeadLetterReason) {
        let mut failures = 0u32;

        loop {
            match self.broker.dead_letter(envelope, &reason).await {
                Ok(()) => {
                    self.hook.on_dead_lettered(envelope, &reason);
                    return;
                }
                Err(err) if err.is_sink_unavailable() => {
                    let delay = self.policy.backoff(failures);
                    failures = failures.saturating_add(1);
                    self.hook.on_sink_unavailable(envelope, &err, delay);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.hard_stop.cancelled() => {
                            self.release(envelope).await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.hook.on_broker_error(&err);
                    return;
                }
            }
        }
    }

    /// Hand an unprocessed envelope back to the broker, attempt unchanged.
    async fn release(&self, envelope: &Envelope) {
        match self
            .broker
            .nack(&envelope.id(), envelope.attempt(), Duration::ZERO)
            .await
        {
            Ok(()) => self.hook.on_released(envelope),
            Err(err) => self.hook.on_broker_error(&err),
        }
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

fn reap(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.try_join_next() {
        log_worker_exit(joined);
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }
}

fn log_worker_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::error!(error = %err, "Consumer worker failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    };

    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        MessageId,
        broker::{BrokerError, DeliveryStream, InMemoryBroker, Location},
        dead_letter::InMemoryDeadLetterSink,
        hook::recording::{Event, RecordingHook},
    };

    type Broker = InMemoryBroker<InMemoryDeadLetterSink>;

    fn broker() -> Broker {
        InMemoryBroker::new(InMemoryDeadLetterSink::default())
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_shutdown_grace(Duration::from_millis(100))
            .with_resubscribe_delay(Duration::from_millis(10))
    }

    fn start<B: BrokerClient, H: Handler>(
        broker: B,
        handler: H,
        config: &DeliveryConfig,
    ) -> (CancellationToken, JoinHandle<()>, Arc<RecordingHook>) {
        let cancel = CancellationToken::new();
        let hook = Arc::new(RecordingHook::default());
        let consumer = ConsumerLoop::new(broker, handler, config).with_hook(Arc::clone(&hook));
        let handle = tokio::spawn(consumer.run(cancel.clone()));
        (cancel, handle, hook)
    }

    async fn publish(broker: &Broker, max_attempts: u32) -> MessageId {
        let envelope = Envelope::new(b"payload".to_vec(), max_attempts);
        let id = envelope.id();
        broker.publish(envelope).await.unwrap();
        id
    }

    async fn settled(broker: &Broker, id: MessageId) -> Location {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match broker.location(&id).await {
                    Some(location @ (Location::Acked | Location::DeadLettered)) => {
                        return location;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("message was not settled in time")
    }

    async fn stop(cancel: CancellationToken, handle: JoinHandle<()>) {
        cancel.cancel();
        handle.await.unwrap();
    }

    /// Handler recording every attempt it sees and answering from `script`.
    fn scripted(
        script: impl Fn(u32) -> DeliveryOutcome + Send + Sync + 'static,
    ) -> (impl Handler, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::clone(&seen);
        let script = Arc::new(script);
        let handler = move |envelope: Envelope| {
            let attempts = Arc::clone(&attempts);
            let script = Arc::clone(&script);
            async move {
                attempts.lock().unwrap().push(envelope.attempt());
                (*script)(envelope.attempt())
            }
        };
        (handler, seen)
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_retryable_failures() {
        let broker = broker();
        let id = publish(&broker, 2).await;
        let (handler, seen) = scripted(|attempt| {
            if attempt < 2 {
                DeliveryOutcome::retry("not yet")
            } else {
                DeliveryOutcome::Success
            }
        });
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::Acked);
        stop(cancel, handle).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert!(broker.sink().is_empty().await);
        let reason = FailureReason::Other("not yet".into());
        assert_eq!(
            hook.events(),
            vec![
                Event::Delivered(id, 0),
                Event::Requeued(id, 1, reason.clone()),
                Event::Delivered(id, 1),
                Event::Requeued(id, 2, reason),
                Event::Delivered(id, 2),
                Event::Acked(id, 2),
            ]
        );
    }

    #[tokio::test]
    async fn exhausting_one_retry_dead_letters_after_two_invocations() {
        let broker = broker();
        let id = publish(&broker, 1).await;
        let (handler, seen) = scripted(|_| DeliveryOutcome::retry("down"));
        let (cancel, handle, _hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::DeadLettered);
        stop(cancel, handle).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        let records = broker.sink().records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].envelope().id(), id);
        assert_eq!(records[0].envelope().attempt(), 1);
        assert_eq!(records[0].reason(), &DeadLetterReason::MaxAttemptsExceeded);
    }

    #[tokio::test]
    async fn always_failing_handler_gets_max_attempts_plus_one_deliveries() {
        let broker = broker();
        let id = publish(&broker, 4).await;
        let (handler, seen) = scripted(|_| DeliveryOutcome::retry("down"));
        let (cancel, handle, _hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::DeadLettered);
        stop(cancel, handle).await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_without_retry() {
        let broker = broker();
        let id = publish(&broker, 5).await;
        let (handler, seen) = scripted(|_| DeliveryOutcome::fatal("malformed"));
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::DeadLettered);
        stop(cancel, handle).await;

        assert_eq!(*seen.lock().unwrap(), vec![0]);
        let reason =
            DeadLetterReason::FatalFailure(FailureReason::Other("malformed".into()));
        assert_eq!(
            hook.events(),
            vec![Event::Delivered(id, 0), Event::DeadLettered(id, 0, reason)]
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_retried_and_loop_survives() {
        let broker = broker();
        let id = publish(&broker, 3).await;
        let handler = |envelope: Envelope| async move {
            if envelope.attempt() == 0 {
                panic!("handler blew up");
            }
            DeliveryOutcome::Success
        };
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::Acked);
        let later = publish(&broker, 3).await;
        assert_eq!(settled(&broker, later).await, Location::Acked);
        stop(cancel, handle).await;

        assert!(
            hook.events()
                .contains(&Event::Requeued(id, 1, FailureReason::HandlerCrashed))
        );
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_is_retried() {
        let broker = broker();
        let id = publish(&broker, 3).await;
        let handler = |envelope: Envelope| async move {
            if envelope.attempt() == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            DeliveryOutcome::Success
        };
        let config = config().with_handler_timeout(Duration::from_millis(50));
        let (cancel, handle, hook) = start(broker.clone(), handler, &config);

        assert_eq!(settled(&broker, id).await, Location::Acked);
        stop(cancel, handle).await;

        assert!(
            hook.events()
                .contains(&Event::Requeued(id, 1, FailureReason::Timeout))
        );
    }

    #[tokio::test]
    async fn prefetch_bounds_concurrent_processing() {
        let broker = broker();
        for _ in 0..10 {
            publish(&broker, 3).await;
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            move |_envelope: Envelope| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                    DeliveryOutcome::Success
                }
            }
        };
        let config = config()
            .with_prefetch(2)
            .with_handler_timeout(Duration::from_secs(3600))
            .with_shutdown_grace(Duration::from_millis(50));
        let (cancel, handle, hook) = start(broker.clone(), handler, &config);

        tokio::time::timeout(Duration::from_secs(5), async {
            while active.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(broker.in_flight().await.len(), 2);
        assert_eq!(broker.pending().await.len(), 8);

        stop(cancel, handle).await;

        let pending = broker.pending().await;
        assert_eq!(pending.len(), 10);
        assert!(pending.iter().all(|envelope| envelope.attempt() == 0));
        assert!(broker.in_flight().await.is_empty());
        let released = hook
            .events()
            .into_iter()
            .filter(|event| matches!(event, Event::Released(..)))
            .count();
        assert_eq!(released, 2);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_handlers_finish_within_grace() {
        let broker = broker();
        let id = publish(&broker, 3).await;
        let started = Arc::new(AtomicBool::new(false));
        let handler = {
            let started = Arc::clone(&started);
            move |_envelope: Envelope| {
                let started = Arc::clone(&started);
                async move {
                    started.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    DeliveryOutcome::Success
                }
            }
        };
        let config = config().with_shutdown_grace(Duration::from_secs(5));
        let (cancel, handle, _hook) = start(broker.clone(), handler, &config);

        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stop(cancel, handle).await;

        assert_eq!(broker.location(&id).await, Some(Location::Acked));
    }

    #[tokio::test]
    async fn sink_outage_is_retried_until_the_record_is_written() {
        let broker = broker();
        broker.sink().fail_next_writes(3).await;
        let id = publish(&broker, 0).await;
        let (handler, _seen) = scripted(|_| DeliveryOutcome::fatal("corrupt"));
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::DeadLettered);
        stop(cancel, handle).await;

        assert_eq!(broker.sink().len().await, 1);
        let outages = hook
            .events()
            .into_iter()
            .filter(|event| *event == Event::SinkUnavailable(id))
            .count();
        assert_eq!(outages, 3);
    }

    #[tokio::test]
    async fn envelope_over_budget_is_dead_lettered_without_handling() {
        let broker = broker();
        let envelope = Envelope::new(Vec::new(), 2).with_attempt(3);
        let id = envelope.id();
        broker.publish(envelope).await.unwrap();
        let (handler, seen) = scripted(|_| DeliveryOutcome::Success);
        let (cancel, handle, _hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&broker, id).await, Location::DeadLettered);
        stop(cancel, handle).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            broker.sink().records().await[0].reason(),
            &DeadLetterReason::MaxAttemptsExceeded
        );
    }

    #[tokio::test]
    async fn every_message_ends_in_exactly_one_terminal_place() {
        let broker = broker();
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(publish(&broker, 2).await);
        }
        let handler = |envelope: Envelope| async move {
            match envelope.id().as_uuid().as_bytes()[0] % 3 {
                0 => DeliveryOutcome::Success,
                1 => DeliveryOutcome::retry("flaky"),
                _ if envelope.attempt() == 0 => DeliveryOutcome::retry("flaky"),
                _ => DeliveryOutcome::fatal("poison"),
            }
        };
        let (cancel, handle, _hook) = start(broker.clone(), handler, &config().with_prefetch(4));

        for id in &ids {
            let location = settled(&broker, *id).await;
            assert_eq!(
                broker.sink().contains(id).await,
                location == Location::DeadLettered
            );
        }
        stop(cancel, handle).await;

        assert!(broker.pending().await.is_empty());
        assert!(broker.in_flight().await.is_empty());
        assert_eq!(
            broker.acked_count().await + broker.sink().len().await,
            ids.len()
        );
    }

    /// Broker whose first subscription attempt fails.
    #[derive(Clone)]
    struct FlakySubscribe {
        inner: Broker,
        failed: Arc<AtomicBool>,
        subscriptions: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl BrokerClient for FlakySubscribe {
        async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
            self.inner.publish(envelope).await
        }

        async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(BrokerError::transport("connection refused"));
            }
            self.inner.consume(cancel).await
        }

        async fn ack(&self, id: &MessageId) -> Result<(), BrokerError> {
            self.inner.ack(id).await
        }

        async fn nack(
            &self,
            id: &MessageId,
            next_attempt: u32,
            visibility_delay: Duration,
        ) -> Result<(), BrokerError> {
            self.inner.nack(id, next_attempt, visibility_delay).await
        }

        async fn dead_letter(
            &self,
            envelope: &Envelope,
            reason: &DeadLetterReason,
        ) -> Result<(), BrokerError> {
            self.inner.dead_letter(envelope, reason).await
        }
    }

    #[tokio::test]
    async fn failed_subscription_is_retried() {
        let inner = broker();
        let broker = FlakySubscribe {
            inner: inner.clone(),
            failed: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(AtomicU32::new(0)),
        };
        let id = publish(&inner, 0).await;
        let (handler, _seen) = scripted(|_| DeliveryOutcome::Success);
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&inner, id).await, Location::Acked);
        stop(cancel, handle).await;

        assert_eq!(broker.subscriptions.load(Ordering::SeqCst), 2);
        assert_eq!(hook.events()[0], Event::BrokerError);
    }

    /// Broker whose stream starts with one undecodable delivery.
    #[derive(Clone)]
    struct MalformedFirst {
        inner: Broker,
        subscriptions: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl BrokerClient for MalformedFirst {
        async fn publish(&self, envelope: Envelope) -> Result<(), BrokerError> {
            self.inner.publish(envelope).await
        }

        async fn consume(&self, cancel: CancellationToken) -> Result<DeliveryStream, BrokerError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let mut rest = self.inner.consume(cancel).await?;
            Ok(Box::pin(async_stream::stream! {
                yield Err(BrokerError::rejected("malformed delivery"));
                while let Some(item) = rest.next().await {
                    yield item;
                }
            }))
        }

        async fn ack(&self, id: &MessageId) -> Result<(), BrokerError> {
            self.inner.ack(id).await
        }

        async fn nack(
            &self,
            id: &MessageId,
            next_attempt: u32,
            visibility_delay: Duration,
        ) -> Result<(), BrokerError> {
            self.inner.nack(id, next_attempt, visibility_delay).await
        }

        async fn dead_letter(
            &self,
            envelope: &Envelope,
            reason: &DeadLetterReason,
        ) -> Result<(), BrokerError> {
            self.inner.dead_letter(envelope, reason).await
        }
    }

    #[tokio::test]
    async fn bad_delivery_does_not_end_the_subscription() {
        let inner = broker();
        let broker = MalformedFirst {
            inner: inner.clone(),
            subscriptions: Arc::new(AtomicU32::new(0)),
        };
        let first = publish(&inner, 0).await;
        let second = publish(&inner, 0).await;
        let (handler, seen) = scripted(|_| DeliveryOutcome::Success);
        let (cancel, handle, hook) = start(broker.clone(), handler, &config());

        assert_eq!(settled(&inner, first).await, Location::Acked);
        assert_eq!(settled(&inner, second).await, Location::Acked);
        stop(cancel, handle).await;

        assert_eq!(broker.subscriptions.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(hook.events()[0], Event::BrokerError);
    }
}
